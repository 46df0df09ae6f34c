//! Distribution of regions across scan workers.

use crate::{error::Error, MemoryMap, RegionId};
use log::debug;

/// Partitions regions across workers so that every worker scans a
/// comparable number of bytes.
#[derive(Debug, Clone, Default)]
pub struct WorkLister {
    partition: Vec<Vec<RegionId>>,
    generation: Option<u64>,
}

impl WorkLister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition the given regions unless a partition for the same area set
    /// generation and worker count already exists.
    ///
    /// Returns `true` if a new partition was computed.
    pub fn update(
        &mut self,
        map: &MemoryMap,
        regions: &[RegionId],
        generation: u64,
        workers: usize,
        force: bool,
    ) -> Result<bool, Error> {
        if !force && self.generation == Some(generation) && self.partition.len() == workers {
            return Ok(false);
        }

        self.partition = partition(map, regions, workers)?;
        self.generation = Some(generation);
        Ok(true)
    }

    /// The current partition, one list of regions per worker.
    pub fn partition(&self) -> &[Vec<RegionId>] {
        &self.partition
    }
}

/// Greedily assign regions, largest first, to the worker with the fewest
/// bytes so far.
///
/// Ties go to the lowest numbered worker, and regions of equal size keep
/// their input order, so the result is deterministic.
pub fn partition(
    map: &MemoryMap,
    regions: &[RegionId],
    workers: usize,
) -> Result<Vec<Vec<RegionId>>, Error> {
    if workers == 0 {
        return Err(Error::NoSessions);
    }

    let mut sized = Vec::with_capacity(regions.len());

    for id in regions {
        let region = map.region(*id).ok_or(Error::UnknownRegion(*id))?;
        sized.push((*id, region.size()));
    }

    let buckets = balance(&sized, workers);

    for (n, (bucket, total)) in buckets.iter().enumerate() {
        debug!("worker {}: {} regions, {:#x} bytes", n, bucket.len(), total);
    }

    Ok(buckets.into_iter().map(|(bucket, _)| bucket).collect())
}

fn balance<T>(items: &[(T, u64)], workers: usize) -> Vec<(Vec<T>, u64)>
where
    T: Copy,
{
    let mut sorted = items.to_vec();
    // NB: stable sort, equally sized items keep their relative order.
    sorted.sort_by(|a, b| b.1.cmp(&a.1));

    let mut buckets = (0..workers)
        .map(|_| (Vec::new(), 0u64))
        .collect::<Vec<_>>();

    if buckets.is_empty() {
        return buckets;
    }

    for (item, size) in sorted {
        let mut smallest = 0;

        for (n, (_, total)) in buckets.iter().enumerate().skip(1) {
            if *total < buckets[smallest].1 {
                smallest = n;
            }
        }

        let bucket = &mut buckets[smallest];
        bucket.0.push(item);
        bucket.1 = bucket.1.saturating_add(size);
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::{balance, partition, WorkLister};
    use crate::{Access, Address, AddressRange, MemoryMap, RegionId};

    fn sums(sizes: &[u64], workers: usize) -> Vec<u64> {
        let items = sizes.iter().copied().enumerate().collect::<Vec<_>>();
        balance(&items, workers).into_iter().map(|(_, s)| s).collect()
    }

    #[test]
    fn test_greedy_assignment() {
        assert_eq!(vec![110, 130, 120], sums(&[100, 90, 80, 40, 40, 10], 3));
    }

    #[test]
    fn test_fairness_bound() {
        let cases: &[(&[u64], usize)] = &[
            (&[100, 90, 80, 40, 40, 10], 3),
            (&[1, 1, 1, 1, 1, 1, 1, 1000], 4),
            (&[7, 7, 7, 7, 7, 7, 7], 2),
            (&[300, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144], 5),
            (&[5], 8),
        ];

        for (sizes, workers) in cases {
            let buckets = sums(sizes, *workers);
            let total = sizes.iter().sum::<u64>();
            let mut sorted = sizes.to_vec();
            sorted.sort_by(|a, b| b.cmp(a));
            let two_largest = sorted.iter().take(2).sum::<u64>();
            let average = (total + *workers as u64 - 1) / *workers as u64;

            let max = buckets.iter().copied().max().unwrap();
            assert!(
                max <= average + two_largest,
                "{:?} over {} workers: {} > {} + {}",
                sizes,
                workers,
                max,
                average,
                two_largest
            );
            assert_eq!(total, buckets.iter().sum::<u64>());
        }
    }

    #[test]
    fn test_ties_go_to_first_worker() {
        let items = vec![('a', 10), ('b', 10), ('c', 10), ('d', 10)];
        let buckets = balance(&items, 2);
        assert_eq!(vec!['a', 'c'], buckets[0].0);
        assert_eq!(vec!['b', 'd'], buckets[1].0);
    }

    #[test]
    fn test_partition_regions() {
        let range = |s: u64, e: u64| AddressRange::new(Address::new(s), Address::new(e)).unwrap();

        let map = MemoryMap::builder()
            .region(range(0x1000, 0x2000), Access::READ, None)
            .region(range(0x2000, 0x6000), Access::READ, None)
            .region(range(0x6000, 0x8000), Access::READ, None)
            .build()
            .unwrap();

        let regions = [RegionId(0), RegionId(1), RegionId(2)];
        let parts = partition(&map, &regions, 2).unwrap();
        assert_eq!(vec![vec![RegionId(1)], vec![RegionId(2), RegionId(0)]], parts);

        assert!(partition(&map, &[RegionId(7)], 2).is_err());
        assert!(partition(&map, &regions, 0).is_err());

        let mut lister = WorkLister::new();
        assert!(lister.update(&map, &regions, 1, 2, false).unwrap());
        assert!(!lister.update(&map, &regions, 1, 2, false).unwrap());
        assert!(lister.update(&map, &regions, 2, 2, false).unwrap());
        assert!(lister.update(&map, &regions, 2, 3, false).unwrap());
        assert!(lister.update(&map, &regions, 2, 3, true).unwrap());
        assert_eq!(3, lister.partition().len());
    }
}
