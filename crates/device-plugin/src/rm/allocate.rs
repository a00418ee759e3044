//! Preferred allocation policies.

use std::collections::BTreeMap;

use error_stack::Report;

use super::device::Device;
use super::device::Devices;
use super::ResourceManagerError;

fn check_size(required: &[String], size: usize) -> Result<(), Report<ResourceManagerError>> {
    if size < required.len() {
        return Err(Report::new(ResourceManagerError::InvalidAllocationSize {
            size,
            required: required.len(),
        }));
    }
    Ok(())
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

/// The required ids followed by available ids in the order given.
pub(crate) fn pass_through(
    available: &[String],
    required: &[String],
    size: usize,
) -> Result<Vec<String>, Report<ResourceManagerError>> {
    check_size(required, size)?;
    let mut chosen = dedup(required);
    for id in available {
        if chosen.len() >= size {
            break;
        }
        if !chosen.contains(id) {
            chosen.push(id.clone());
        }
    }
    Ok(chosen)
}

/// The required ids followed by the best available ones.
///
/// Candidates are healthy, known available devices. They are ranked by
/// sharing a physical GPU with a device already chosen, then by sitting on
/// the anchor NUMA node, then by enumeration order. The anchor is the first
/// required device's NUMA node, or with nothing required the node holding
/// the most candidates.
pub(crate) fn topology_aware(
    devices: &Devices,
    available: &[String],
    required: &[String],
    size: usize,
) -> Result<Vec<String>, Report<ResourceManagerError>> {
    check_size(required, size)?;
    let mut chosen = dedup(required);

    let mut candidates: Vec<(usize, &Device)> = dedup(available)
        .iter()
        .filter(|id| !chosen.contains(*id))
        .filter_map(|id| Some((devices.position(id)?, devices.get(id)?)))
        .filter(|(_, device)| device.is_healthy())
        .collect();

    let anchor = match required.first() {
        Some(id) => devices.get(id).and_then(|d| d.numa_node),
        None => busiest_numa_node(candidates.iter().map(|(_, d)| *d)),
    };

    while chosen.len() < size && !candidates.is_empty() {
        let best = candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, (position, device))| {
                let shares_parent = chosen
                    .iter()
                    .filter_map(|id| devices.get(id))
                    .any(|c| c.physical_id() == device.physical_id());
                let on_anchor = anchor.is_some() && device.numa_node == anchor;
                (!shares_parent, !on_anchor, *position)
            })
            .map(|(i, _)| i);
        let Some(best) = best else {
            break;
        };
        let (_, device) = candidates.remove(best);
        chosen.push(device.id.clone());
    }

    Ok(chosen)
}

/// NUMA node with the most devices, ties going to the lowest node.
fn busiest_numa_node<'a>(devices: impl Iterator<Item = &'a Device>) -> Option<u32> {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for node in devices.filter_map(|d| d.numa_node) {
        *counts.entry(node).or_default() += 1;
    }
    counts
        .into_iter()
        .rev()
        .max_by_key(|(_, count)| *count)
        .map(|(node, _)| node)
}
