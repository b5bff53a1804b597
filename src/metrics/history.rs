//! Bounded duration history with two eviction policies

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use crate::config::RetentionStrategy;

/// f64 with a total order, for the outlier heap
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample(f64);

impl Eq for Sample {}

impl PartialOrd for Sample {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sample {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug)]
pub(super) enum DurationHistory {
    /// Most recent samples, oldest at the front
    Recent { samples: VecDeque<f64>, capacity: usize },
    /// Largest samples seen so far; min-heap so the smallest is evicted first
    Outliers {
        heap: BinaryHeap<Reverse<Sample>>,
        capacity: usize,
    },
}

impl DurationHistory {
    pub(super) fn new(strategy: RetentionStrategy, capacity: usize) -> Self {
        match strategy {
            RetentionStrategy::Recent => Self::Recent {
                samples: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            },
            RetentionStrategy::Outliers => Self::Outliers {
                heap: BinaryHeap::with_capacity(capacity.min(1024) + 1),
                capacity,
            },
        }
    }

    pub(super) fn extend(&mut self, batch: impl IntoIterator<Item = f64>) {
        match self {
            Self::Recent { samples, capacity } => {
                for d in batch {
                    if samples.len() == *capacity {
                        samples.pop_front();
                    }
                    samples.push_back(d);
                }
            }
            Self::Outliers { heap, capacity } => {
                for d in batch {
                    heap.push(Reverse(Sample(d)));
                    if heap.len() > *capacity {
                        heap.pop();
                    }
                }
            }
        }
    }

    pub(super) fn to_vec(&self) -> Vec<f64> {
        match self {
            Self::Recent { samples, .. } => samples.iter().copied().collect(),
            Self::Outliers { heap, .. } => {
                let mut out: Vec<f64> = heap.iter().map(|Reverse(s)| s.0).collect();
                out.sort_by(|a, b| b.total_cmp(a));
                out
            }
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        match self {
            Self::Recent { samples, .. } => samples.len(),
            Self::Outliers { heap, .. } => heap.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_keeps_tail_in_order() {
        let mut h = DurationHistory::new(RetentionStrategy::Recent, 3);
        h.extend([1.0, 2.0]);
        h.extend([3.0, 4.0, 5.0]);
        assert_eq!(h.to_vec(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_outliers_never_exceed_capacity() {
        let mut h = DurationHistory::new(RetentionStrategy::Outliers, 3);
        h.extend((0..100).map(|i| ((i * 37) % 100) as f64));
        assert_eq!(h.len(), 3);
        assert_eq!(h.to_vec(), vec![99.0, 98.0, 97.0]);
    }
}
