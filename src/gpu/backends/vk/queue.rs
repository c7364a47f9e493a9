use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use ash::vk;

/// A device queue. Submission and presentation need external
/// synchronization, so every use goes through [`Queue::lock`].
pub struct Queue {
    pub family: QueueFamily,
    handle: Mutex<vk::Queue>,
}

impl Queue {
    pub fn new(
        family: QueueFamily,
        handle: vk::Queue,
    ) -> Self {
        Self {
            family,
            handle: Mutex::new(handle),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, vk::Queue> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
    supports_present: bool,
}

impl QueueFamily {
    pub fn new(
        index: u32,
        properties: vk::QueueFamilyProperties,
        supports_present: bool
    ) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    pub fn supports_present(&self) -> bool {
        self.supports_present
    }

    pub fn supports_graphics(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_transfer(&self) -> bool {
        // Graphics and compute queues implicitly support transfers.
        self.properties.queue_flags.intersects(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
    }
}

impl PartialEq for QueueFamily {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for QueueFamily {}

impl Hash for QueueFamily {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

/// Picks one family per queue kind. Compute and transfer prefer families
/// other than the graphics one and fall back to it.
pub fn select_families(
    props: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
    presenting: bool,
) -> Option<(QueueFamily, QueueFamily, QueueFamily)> {
    let families: Vec<_> = props
        .iter()
        .enumerate()
        .map(|(i, p)| QueueFamily::new(i as u32, *p, presenting && supports_present(i as u32)))
        .collect();

    let graphics = *families
        .iter()
        .find(|f| f.supports_graphics() && (!presenting || f.supports_present()))?;
    let compute = families
        .iter()
        .find(|f| f.supports_compute() && **f != graphics)
        .copied()
        .unwrap_or(graphics);
    let transfer = families
        .iter()
        .find(|f| f.supports_transfer() && **f != graphics && **f != compute)
        .copied()
        .unwrap_or(compute);

    Some((graphics, compute, transfer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let props = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let (graphics, compute, transfer) = select_families(&props, |_| true, true).unwrap();
        assert_eq!((graphics.index, compute.index, transfer.index), (0, 1, 2));
        assert!(graphics.supports_present());
    }

    #[test]
    fn single_family_serves_every_kind() {
        let props = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let (graphics, compute, transfer) = select_families(&props, |_| false, false).unwrap();
        assert_eq!((graphics.index, compute.index, transfer.index), (0, 0, 0));
    }

    #[test]
    fn presenting_requires_a_present_capable_graphics_family() {
        let props = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let (graphics, _, _) = select_families(&props, |i| i == 1, true).unwrap();
        assert_eq!(graphics.index, 1);
        assert!(select_families(&props, |_| false, true).is_none());
    }
}
