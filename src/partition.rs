use std::ops::Range;

use log::warn;

use crate::config::DeviceSet;

/// A half open `[begin, end)` range of batch rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub begin: usize,
    pub end: usize,
}

impl SliceRange {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.begin..self.end
    }
}

/// The maximum amount of rows a single replica is handed.
///
/// # Arguments
/// * `batch_size` - The configured batch size.
/// * `ndevice` - The amount of replicas sharing the batch.
pub fn step_size(batch_size: usize, ndevice: usize) -> usize {
    batch_size.div_ceil(ndevice.max(1)).max(1)
}

/// Splits a batch into one contiguous slice per replica.
///
/// Earlier replicas get full `step` sized slices, only the trailing ones may be short or empty.
/// A batch larger than the configured size widens the step so the slices still cover it.
///
/// # Arguments
/// * `batch_size` - The true amount of rows in the batch.
/// * `ndevice` - The amount of replicas.
/// * `configured` - The configured batch size.
pub fn partition(batch_size: usize, ndevice: usize, configured: usize) -> Vec<SliceRange> {
    let step = step_size(configured.max(batch_size), ndevice);

    (0..ndevice)
        .map(|i| {
            let begin = (i * step).min(batch_size);
            let end = ((i + 1) * step).min(batch_size);
            SliceRange::new(begin, end)
        })
        .collect()
}

/// Drops the trailing devices that would never receive a row of a full batch.
///
/// # Returns
/// The step size computed from the original device count.
pub fn shrink_devices(devices: &mut DeviceSet, batch_size: usize) -> usize {
    let step = step_size(batch_size, devices.len());
    let mut ndevice = devices.len();

    while ndevice > 1 && step * (ndevice - 1) >= batch_size {
        ndevice -= 1;
    }

    if ndevice < devices.len() {
        warn!(
            "a mini-batch of {step} rows per device only needs {ndevice} of the {} devices to cover batch_size={batch_size}",
            devices.len()
        );
        devices.truncate(ndevice);
    }

    step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_batch_exactly_once() {
        for configured in 1..=12 {
            for ndevice in 1..=5 {
                for batch_size in 1..=configured + 3 {
                    let slices = partition(batch_size, ndevice, configured);
                    assert_eq!(slices.len(), ndevice);

                    let mut next = 0;
                    for slice in &slices {
                        assert_eq!(slice.begin, next);
                        assert!(slice.end <= batch_size);
                        next = slice.end;
                    }
                    assert_eq!(next, batch_size, "{batch_size} {ndevice} {configured}");

                    let lens: Vec<_> = slices.iter().map(SliceRange::len).collect();
                    assert!(lens.windows(2).all(|w| w[0] >= w[1]));
                }
            }
        }
    }

    #[test]
    fn test_partition_short_last_batch() {
        let slices = partition(7, 3, 9);
        assert_eq!(
            slices,
            vec![
                SliceRange::new(0, 3),
                SliceRange::new(3, 6),
                SliceRange::new(6, 7)
            ]
        );

        let slices = partition(3, 3, 9);
        assert!(slices[1].is_empty());
        assert!(slices[2].is_empty());
        assert_eq!(slices[2].range(), 3..3);
    }

    #[test]
    fn test_step_size_is_at_least_one() {
        assert_eq!(step_size(1, 4), 1);
        assert_eq!(step_size(10, 4), 3);
        assert_eq!(step_size(8, 4), 2);
    }

    #[test]
    fn test_shrink_devices() {
        let mut devices = DeviceSet::parse("0-7").unwrap();
        let step = shrink_devices(&mut devices, 10);
        assert_eq!(step, 2);
        assert_eq!(&*devices, &[0, 1, 2, 3, 4]);
        assert!(step * (devices.len() - 1) < 10);

        let mut devices = DeviceSet::parse("0-3").unwrap();
        shrink_devices(&mut devices, 1);
        assert_eq!(&*devices, &[0]);

        let mut devices = DeviceSet::parse("0-3").unwrap();
        shrink_devices(&mut devices, 8);
        assert_eq!(devices.len(), 4);
    }

    #[test]
    fn test_shrink_devices_property() {
        for batch_size in 1..=20 {
            for ndevice in 1..=8 {
                let mut devices = DeviceSet::new((0..ndevice).collect()).unwrap();
                let step = shrink_devices(&mut devices, batch_size);
                assert!(!devices.is_empty());
                assert!(devices.len() == 1 || step * (devices.len() - 1) < batch_size);
            }
        }
    }
}
