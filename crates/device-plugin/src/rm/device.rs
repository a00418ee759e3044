use std::collections::HashSet;

use derive_more::Display;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum Health {
    #[default]
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

/// One allocatable unit exposed by a resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// GPU UUID, MIG UUID or Tegra index
    pub id: String,
    pub health: Health,
    /// `"0"` for a whole GPU, `"0:1"` for a MIG device
    pub index: String,
    /// Device nodes handed to the container
    pub paths: Vec<String>,
    /// Bytes
    pub total_memory: u64,
    pub numa_node: Option<u32>,
    /// UUID of the physical GPU a MIG device lives on
    pub parent: Option<String>,
}

impl Device {
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }

    /// Whether an event reported for `uuid` concerns this device.
    pub fn matches_uuid(&self, uuid: &str) -> bool {
        self.id == uuid || self.parent.as_deref() == Some(uuid)
    }

    /// The physical GPU this device belongs to.
    pub fn physical_id(&self) -> &str {
        self.parent.as_deref().unwrap_or(&self.id)
    }
}

/// Devices in enumeration order with unique ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Devices(Vec<Device>);

impl Devices {
    pub fn ids(&self) -> Vec<String> {
        self.0.iter().map(|d| d.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.0.iter().find(|d| d.id == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Position of `id` in enumeration order.
    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.0.iter().position(|d| d.id == id)
    }

    /// Mark every device concerned by an event on `uuid` unhealthy, or every
    /// device when the event carries no usable UUID. Returns the marked devices.
    pub(crate) fn mark_unhealthy(&mut self, uuid: Option<&str>) -> Vec<Device> {
        let known = uuid.filter(|uuid| self.0.iter().any(|d| d.matches_uuid(uuid)));
        self.0
            .iter_mut()
            .filter(|d| known.map_or(true, |uuid| d.matches_uuid(uuid)))
            .map(|d| {
                d.health = Health::Unhealthy;
                d.clone()
            })
            .collect()
    }

    /// Carry unhealthy marks of `previous` over to a fresh enumeration.
    pub(crate) fn keep_unhealthy_from(mut self, previous: &Devices) -> Self {
        for device in &mut self.0 {
            if previous.get(&device.id).is_some_and(|d| !d.is_healthy()) {
                device.health = Health::Unhealthy;
            }
        }
        self
    }
}

impl FromIterator<Device> for Devices {
    /// Later devices with an id already seen are dropped.
    fn from_iter<T: IntoIterator<Item = Device>>(iter: T) -> Self {
        let mut seen = HashSet::new();
        Self(
            iter.into_iter()
                .filter(|d| seen.insert(d.id.clone()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a Devices {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
pub(crate) fn test_device(id: &str, parent: Option<&str>, numa_node: Option<u32>) -> Device {
    Device {
        id: id.to_string(),
        health: Health::Healthy,
        index: id.to_string(),
        paths: vec![format!("/dev/{id}")],
        total_memory: 0,
        numa_node,
        parent: parent.map(ToString::to_string),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn duplicate_ids_collapse_to_first() {
        let mut second = test_device("GPU-0", None, Some(1));
        second.index = "1".to_string();
        let devices: Devices = [
            test_device("GPU-0", None, Some(0)),
            test_device("GPU-1", None, None),
            second,
        ]
        .into_iter()
        .collect();

        assert_eq!(devices.ids(), vec!["GPU-0", "GPU-1"]);
        assert_eq!(devices.get("GPU-0").and_then(|d| d.numa_node), Some(0));
    }

    #[test]
    fn marks_devices_by_own_or_parent_uuid() {
        let mut devices: Devices = [
            test_device("MIG-0", Some("GPU-0"), None),
            test_device("MIG-1", Some("GPU-0"), None),
            test_device("GPU-1", None, None),
        ]
        .into_iter()
        .collect();

        let marked = devices.mark_unhealthy(Some("GPU-0"));
        assert_eq!(marked.len(), 2);
        assert!(!devices.get("MIG-0").expect("known").is_healthy());
        assert!(devices.get("GPU-1").expect("known").is_healthy());

        let marked = devices.mark_unhealthy(Some("GPU-1"));
        assert_eq!(marked.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec!["GPU-1"]);
    }

    #[test]
    fn unknown_uuid_marks_everything() {
        let mut devices: Devices = [test_device("GPU-0", None, None), test_device("GPU-1", None, None)]
            .into_iter()
            .collect();
        assert_eq!(devices.mark_unhealthy(Some("GPU-9")).len(), 2);

        let mut devices: Devices = [test_device("GPU-0", None, None)].into_iter().collect();
        assert_eq!(devices.mark_unhealthy(None).len(), 1);
    }

    #[test]
    fn refresh_keeps_unhealthy_marks() {
        let mut previous: Devices = [test_device("GPU-0", None, None), test_device("GPU-1", None, None)]
            .into_iter()
            .collect();
        previous.mark_unhealthy(Some("GPU-1"));

        let fresh: Devices = [test_device("GPU-1", None, None), test_device("GPU-2", None, None)]
            .into_iter()
            .collect();
        let fresh = fresh.keep_unhealthy_from(&previous);

        assert_eq!(fresh.get("GPU-1").expect("known").health, Health::Unhealthy);
        assert_eq!(fresh.get("GPU-2").expect("known").health, Health::Healthy);
    }
}
