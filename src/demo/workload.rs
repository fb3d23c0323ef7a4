use std::fmt;
use crate::data::IntBuffer;

/// Invocations per workgroup; also the widest slice one group reduces.
pub const GROUP_SIZE: usize = 1024;

/// The host-side inputs of one add-and-reduce run together with the
/// expectations the GPU results are checked against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workload {
    pub add_value: i32,
    pub source: IntBuffer,
    pub group_values: IntBuffer,
}

impl Workload {
    /// `source[i] = i + 1` and every element of group `g` holds `g + 1`.
    pub fn new(element_count: usize, add_value: i32) -> Workload {
        let source = (0..element_count).map(|i| i as i32 + 1).collect();
        let group_values = (0..element_count).map(|i| (i / GROUP_SIZE) as i32 + 1).collect();
        Workload {
            add_value,
            source: IntBuffer::new(source),
            group_values: IntBuffer::new(group_values),
        }
    }

    pub fn element_count(&self) -> usize {
        self.source.data.len()
    }

    pub fn group_count(&self) -> usize {
        self.element_count().div_ceil(GROUP_SIZE)
    }

    /// Wrapping sum of group `group`'s slice, as the kernel computes it.
    pub fn expected_group_sum(&self, group: usize) -> i32 {
        let start = group * GROUP_SIZE;
        let end = (start + GROUP_SIZE).min(self.element_count());
        self.group_values.data[start..end]
            .iter()
            .fold(0i32, |total, value| total.wrapping_add(*value))
    }

    /// Checks the read-back `added` and `reduced` buffers against the inputs.
    pub fn verify(&self, added: &[i32], reduced: &[i32]) -> VerificationReport {
        let add_mismatch = self
            .source
            .data
            .iter()
            .zip(added)
            .enumerate()
            .find(|(_, (source, added))| added.wrapping_sub(self.add_value) != **source)
            .map(|(index, (source, added))| Mismatch {
                index,
                expected: source.wrapping_add(self.add_value),
                actual: *added,
            })
            .or_else(|| length_mismatch(self.element_count(), added.len()));

        let group_sums = (0..self.group_count())
            .map(|group| reduced.get(group * GROUP_SIZE).copied().unwrap_or_default())
            .collect::<Vec<_>>();
        let sum_mismatch = group_sums
            .iter()
            .enumerate()
            .find(|(group, sum)| **sum != self.expected_group_sum(*group))
            .map(|(group, sum)| Mismatch {
                index: group * GROUP_SIZE,
                expected: self.expected_group_sum(group),
                actual: *sum,
            })
            .or_else(|| length_mismatch(self.element_count(), reduced.len()));

        let untouched_mismatch = self
            .group_values
            .data
            .iter()
            .zip(reduced)
            .enumerate()
            .filter(|(index, _)| index % GROUP_SIZE != 0)
            .find(|(_, (expected, actual))| expected != actual)
            .map(|(index, (expected, actual))| Mismatch {
                index,
                expected: *expected,
                actual: *actual,
            });

        VerificationReport {
            group_sums,
            add_mismatch,
            sum_mismatch,
            untouched_mismatch,
        }
    }
}

fn length_mismatch(expected: usize, actual: usize) -> Option<Mismatch> {
    (actual < expected).then(|| Mismatch {
        index: actual,
        expected: expected as i32,
        actual: actual as i32,
    })
}

/// First element at which a result diverged from what was expected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub index: usize,
    pub expected: i32,
    pub actual: i32,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} index elements are not equal! expected {}, got {}",
            self.index, self.expected, self.actual
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationReport {
    /// The value at the head of every group after the reduction.
    pub group_sums: Vec<i32>,
    pub add_mismatch: Option<Mismatch>,
    pub sum_mismatch: Option<Mismatch>,
    pub untouched_mismatch: Option<Mismatch>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Numbered checks that failed, in check order.
    pub fn failures(&self) -> impl Iterator<Item = (usize, Mismatch)> + '_ {
        [self.add_mismatch, self.sum_mismatch, self.untouched_mismatch]
            .into_iter()
            .enumerate()
            .filter_map(|(i, mismatch)| mismatch.map(|mismatch| (i + 1, mismatch)))
    }

    pub fn print(&self) {
        let checks = [self.add_mismatch, self.sum_mismatch, self.untouched_mismatch];
        for (i, mismatch) in checks.iter().enumerate() {
            match mismatch {
                Some(mismatch) => println!("Verification {} failed: {}", i + 1, mismatch),
                None => println!("Verification {} OK!", i + 1),
            }
        }
        let shown = self
            .group_sums
            .iter()
            .take(4)
            .enumerate()
            .map(|(group, sum)| format!("[{}] = {}", group * GROUP_SIZE, sum))
            .collect::<Vec<_>>();
        println!("{}", shown.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// What a correct GPU run leaves behind.
    fn gpu_results(workload: &Workload) -> (Vec<i32>, Vec<i32>) {
        let added = workload
            .source
            .data
            .iter()
            .map(|value| value.wrapping_add(workload.add_value))
            .collect();
        let mut reduced = workload.group_values.data.clone();
        for group in 0..workload.group_count() {
            reduced[group * GROUP_SIZE] = workload.expected_group_sum(group);
        }
        (added, reduced)
    }

    #[test]
    fn classic_inputs_match_the_four_group_layout() {
        let workload = Workload::new(4096, 1);
        assert_eq!(workload.group_count(), 4);
        assert_eq!(workload.source.data[0], 1);
        assert_eq!(workload.source.data[4095], 4096);
        assert_eq!(workload.group_values.data[1023], 1);
        assert_eq!(workload.group_values.data[1024], 2);
        assert_eq!(workload.group_values.data[4095], 4);
        let sums = (0..4).map(|g| workload.expected_group_sum(g)).collect::<Vec<_>>();
        assert_eq!(sums, vec![1024, 2048, 3072, 4096]);
    }

    #[test]
    fn trailing_partial_group_sums_only_its_elements() {
        let workload = Workload::new(2500, 1);
        assert_eq!(workload.group_count(), 3);
        assert_eq!(workload.expected_group_sum(2), 452 * 3);
    }

    #[test]
    fn correct_results_pass_every_check() {
        let workload = Workload::new(3000, 5);
        let (added, reduced) = gpu_results(&workload);
        let report = workload.verify(&added, &reduced);
        assert!(report.is_ok(), "{report:?}");
        assert_eq!(report.group_sums, vec![1024, 2048, 952 * 3]);
    }

    #[test]
    fn add_check_reports_the_first_bad_element() {
        let workload = Workload::new(2048, 1);
        let (mut added, reduced) = gpu_results(&workload);
        added[17] = 0;
        added[900] = 0;
        let report = workload.verify(&added, &reduced);
        assert_eq!(report.add_mismatch, Some(Mismatch { index: 17, expected: 19, actual: 0 }));
        assert_eq!(report.failures().map(|(check, _)| check).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn wrong_group_sum_fails_the_second_check() {
        let workload = Workload::new(2048, 1);
        let (added, mut reduced) = gpu_results(&workload);
        reduced[1024] = 7;
        let report = workload.verify(&added, &reduced);
        assert_eq!(report.sum_mismatch, Some(Mismatch { index: 1024, expected: 2048, actual: 7 }));
        assert!(report.untouched_mismatch.is_none());
    }

    #[test]
    fn writes_outside_group_heads_fail_the_third_check() {
        let workload = Workload::new(4096, 1);
        let (added, mut reduced) = gpu_results(&workload);
        // A total landing in the leading slots instead of the group head.
        reduced[1] = 2048;
        let report = workload.verify(&added, &reduced);
        assert_eq!(report.untouched_mismatch, Some(Mismatch { index: 1, expected: 1, actual: 2048 }));
        assert!(!report.is_ok());
    }

    #[test]
    fn short_readback_is_a_failure() {
        let workload = Workload::new(2048, 1);
        let (added, reduced) = gpu_results(&workload);
        let report = workload.verify(&added[..100], &reduced);
        assert_eq!(report.add_mismatch, Some(Mismatch { index: 100, expected: 2048, actual: 100 }));
    }

    #[test]
    fn add_value_wraps_like_the_gpu() {
        let mut workload = Workload::new(4, i32::MAX);
        workload.source.data[0] = 1;
        let (added, reduced) = gpu_results(&workload);
        assert_eq!(added[0], i32::MIN);
        assert!(workload.verify(&added, &reduced).is_ok());
    }

    #[test]
    fn mismatch_display_names_the_index() {
        let mismatch = Mismatch { index: 3, expected: 4, actual: 5 };
        assert_eq!(mismatch.to_string(), "3 index elements are not equal! expected 4, got 5");
    }
}
