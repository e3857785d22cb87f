//! XOR-parity erasure code maps
//!
//! Each supported supplier count has a fixed bipartite map describing which
//! data segments feed each parity segment. Recoverability is transitive: a
//! parity group missing exactly one data member can reconstruct it, which may
//! in turn complete another group. All reachability questions are answered
//! here with pure presence-vector math; actual byte work lives in [`codec`].

pub mod codec;

use std::fmt;

use crate::error::{Error, Result};

/// Supplier counts with a published parity map.
pub const SUPPORTED_SUPPLIER_COUNTS: [usize; 7] = [2, 4, 7, 13, 18, 26, 64];

const MAP_2X2: &[&[usize]] = &[&[1], &[0]];

const MAP_4X4: &[&[usize]] = &[&[1, 2, 3], &[0, 2], &[0, 3], &[0, 1]];

const MAP_7X7: &[&[usize]] = &[
    &[3, 4, 6],
    &[0, 4, 5],
    &[1, 5, 6],
    &[0, 2, 6],
    &[0, 1, 3],
    &[1, 2, 4],
    &[2, 3, 5],
];

const MAP_13X13: &[&[usize]] = &[
    &[1, 4, 8, 12],
    &[5, 8, 9, 11],
    &[3, 7, 10, 11],
    &[0, 4, 6, 9],
    &[2, 3, 6, 12],
    &[0, 1, 6, 10],
    &[1, 3, 7, 9],
    &[2, 5, 8, 12],
    &[2, 4, 7, 11],
    &[0, 1, 3, 5, 12],
    &[6, 7, 8],
    &[2, 5, 9, 10],
    &[0, 4, 10, 11],
];

const MAP_18X18: &[&[usize]] = &[
    &[5, 7, 11, 16, 17],
    &[2, 9, 11, 13, 17],
    &[5, 8, 9, 13, 15],
    &[0, 1, 4, 6, 10],
    &[2, 3, 12, 13, 14],
    &[6, 8, 13, 17],
    &[2, 5, 10, 12],
    &[3, 10, 11, 14],
    &[0, 1, 3, 4, 5, 6, 7, 9, 10, 11, 13, 14, 15, 16, 17],
    &[0, 1, 12, 14],
    &[5, 6, 8, 14, 16],
    &[0, 4, 7, 9],
    &[2, 4, 7, 8],
    &[3, 4, 6, 11, 15],
    &[0, 10, 15, 16],
    &[1, 2, 17],
    &[3, 8, 12, 15],
    &[1, 7, 9, 12, 16],
];

const MAP_26X26: &[&[usize]] = &[
    &[1, 8, 11, 16, 19, 21],
    &[3, 6, 8, 17, 23],
    &[6, 7, 11, 17, 21, 25],
    &[0, 10, 13, 14, 21],
    &[5, 9, 10, 18, 22],
    &[12, 13, 17, 20, 21, 22],
    &[1, 2, 9, 13],
    &[2, 3, 5, 9, 20, 22],
    &[0, 6, 9, 12, 15, 25],
    &[2, 7, 14, 15, 16, 24],
    &[2, 5, 6, 11, 15, 16, 18, 19, 23],
    &[2, 10, 12, 13, 14, 20, 23],
    &[0, 3, 4, 11, 19],
    &[0, 1, 4, 18, 19, 20, 23, 25],
    &[1, 5, 7, 11, 20, 21, 25],
    &[1, 4, 16, 17, 18],
    &[2, 4, 11, 22, 24],
    &[5, 12, 13, 14, 16, 24],
    &[3, 7, 10, 20, 22, 24, 25],
    &[0, 8, 10, 12, 17],
    &[0, 8, 9, 17, 19, 22, 25],
    &[4, 5, 15, 16, 22],
    &[6, 8, 12, 14, 15, 18, 23],
    &[1, 3, 7, 13, 19, 24],
    &[0, 3, 4, 7, 14, 15, 21, 23],
    &[6, 8, 9, 10, 18, 24],
];

const MAP_64X64: &[&[usize]] = &[
    &[5, 17, 18, 31, 39, 47, 55, 58],
    &[0, 3, 4, 25, 27, 32, 34, 48, 53, 56, 63],
    &[10, 11, 17, 18, 25, 32, 36, 40, 45, 51],
    &[1, 21, 23, 27, 30, 35, 43, 47, 62],
    &[2, 19, 20, 21, 28, 29, 37, 38, 40, 55, 56, 62],
    &[15, 17, 19, 20, 31, 45, 46, 54, 57, 63],
    &[19, 20, 30, 36, 46, 47, 52, 62],
    &[2, 5, 16, 18, 19, 37, 48, 55],
    &[1, 2, 7, 12, 13, 20, 26, 28, 48, 55],
    &[0, 1, 15, 21, 24, 33, 36, 41, 56, 62],
    &[19, 20, 28, 30, 43, 45, 52, 57, 59],
    &[2, 6, 12, 20, 34, 58, 61, 63],
    &[5, 6, 13, 15, 25, 34, 36, 40, 42, 43, 50, 51, 55, 61, 62],
    &[21, 22, 23, 34, 39, 41, 43, 45, 49, 52, 53, 58],
    &[0, 12, 17, 19, 28, 57, 58, 63],
    &[8, 18, 25, 29, 34, 49, 52, 53, 56, 62],
    &[3, 6, 19, 23, 35, 39, 40, 43, 49, 54, 57],
    &[2, 3, 8, 9, 30, 31, 47, 54, 58, 62],
    &[0, 8, 14, 24, 28, 33, 36, 47, 52, 58],
    &[8, 10, 13, 22, 25, 27, 32, 35, 40, 51, 56],
    &[2, 14, 16, 17, 26, 27, 29, 31, 43, 46, 54, 56],
    &[22, 25, 37, 41, 45, 52, 61],
    &[5, 9, 13, 32, 46, 50, 54, 62],
    &[0, 4, 5, 10, 15, 16, 26, 36, 37, 48, 50],
    &[13, 14, 20, 21, 40, 42, 55, 60],
    &[1, 2, 13, 15, 16, 19, 26, 30, 37, 42, 48, 50, 59],
    &[4, 10, 11, 18, 28, 30, 44, 45, 46, 60, 63],
    &[2, 6, 16, 22, 24, 38, 41, 53, 59],
    &[6, 15, 21, 23, 26, 29, 32, 34, 35, 36, 38, 43, 51, 54, 60],
    &[13, 24, 32, 33, 34, 41, 46, 52, 58, 61],
    &[1, 10, 23, 24, 27, 29, 40, 41, 61],
    &[4, 5, 6, 10, 14, 42, 44, 48, 51, 53, 61],
    &[0, 5, 7, 15, 49, 50],
    &[8, 29, 35, 36, 43, 47, 51, 60, 62],
    &[7, 12, 15, 21, 22, 27, 31, 33, 57, 60],
    &[5, 16, 18, 24, 26, 33, 38, 44, 46, 53, 56, 57, 61],
    &[1, 3, 4, 9, 24, 27, 31, 39, 50, 51, 54, 58],
    &[12, 18, 22, 23, 27, 35, 36, 44, 60, 63],
    &[0, 12, 17, 20, 32, 35, 37, 50, 53, 59],
    &[8, 11, 14, 16, 22, 24, 35, 36, 41, 42, 44, 46, 57],
    &[14, 23, 30, 33, 34, 38, 42, 44, 46, 48, 54],
    &[9, 14, 27, 31, 33, 35, 49, 51, 52, 54],
    &[3, 8, 11, 12, 14, 30, 32, 34, 48, 56, 62],
    &[7, 9, 29, 44, 46, 58],
    &[6, 18, 21, 26, 28, 39, 40, 45, 47, 55, 58, 63],
    &[4, 17, 21, 26, 30, 34, 54, 61],
    &[0, 5, 6, 10, 23, 29, 39, 55, 60],
    &[7, 9, 10, 11, 12, 18, 25, 26, 29, 37, 38, 39, 42, 45, 49],
    &[6, 7, 17, 27, 33, 56, 59, 60],
    &[1, 3, 9, 14, 20, 28, 42, 47, 57, 63],
    &[11, 17, 23, 25, 39, 41, 45, 53, 56, 57, 60, 61, 63],
    &[4, 8, 12, 16, 19, 28, 31, 32, 47],
    &[2, 4, 22, 23, 26, 39, 41, 42, 51, 59],
    &[0, 3, 9, 13, 25, 40, 43],
    &[0, 9, 10, 16, 22, 47, 53, 55],
    &[1, 3, 4, 7, 13, 20, 21, 25, 49, 50],
    &[6, 12, 15, 16, 17, 29, 33, 38, 48, 50, 55, 57, 59],
    &[1, 15, 24, 28, 37, 40, 42, 52],
    &[1, 4, 7, 13, 14, 30, 38, 59],
    &[11, 31, 33, 37, 44, 49, 51, 52],
    &[8, 11, 24, 31, 32, 35, 50, 53, 59, 63],
    &[3, 8, 11, 18, 22, 38, 44, 49],
    &[7, 9, 10, 19, 37, 41, 44, 45, 49, 60, 61],
    &[2, 3, 5, 7, 11, 38, 39, 43, 48, 59],
];

fn raw_map(suppliers: usize) -> Option<&'static [&'static [usize]]> {
    match suppliers {
        2 => Some(MAP_2X2),
        4 => Some(MAP_4X4),
        7 => Some(MAP_7X7),
        13 => Some(MAP_13X13),
        18 => Some(MAP_18X18),
        26 => Some(MAP_26X26),
        64 => Some(MAP_64X64),
        _ => None,
    }
}

/// Guaranteed number of simultaneous fragment losses each map tolerates.
fn correctable_for(suppliers: usize) -> usize {
    match suppliers {
        64 => 10,
        26 => 6,
        18 => 5,
        13 => 4,
        7 => 3,
        4 => 2,
        _ => 1,
    }
}

/// Number of dead suppliers that makes replacement urgent.
fn fire_hire_for(suppliers: usize) -> usize {
    match suppliers {
        64 => 5,
        26 => 3,
        18 | 13 => 2,
        7 => 2,
        _ => 1,
    }
}

/// Erasure code map for a fixed supplier count.
///
/// Presence vectors passed to the query methods use `true` = have,
/// `false` = don't have. Tri-state collapsing happens above this layer.
#[derive(Debug, Clone)]
pub struct EccMap {
    suppliers: usize,
    parity_to_data: Vec<Vec<usize>>,
    data_to_parity: Vec<Vec<usize>>,
    data_segments: usize,
    parity_segments: usize,
    correctable_errors: usize,
    fire_hire_errors: usize,
}

impl EccMap {
    /// Build the map for `suppliers` peers.
    ///
    /// # Errors
    /// Returns an error if `suppliers` has no published map, or if the
    /// embedded table fails its consistency check.
    pub fn new(suppliers: usize) -> Result<Self> {
        let raw = raw_map(suppliers).ok_or(Error::UnsupportedSupplierCount(suppliers))?;
        let parity_to_data: Vec<Vec<usize>> = raw.iter().map(|group| group.to_vec()).collect();
        let parity_segments = parity_to_data.len();
        let data_segments = parity_to_data
            .iter()
            .flat_map(|group| group.iter().copied())
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        if data_segments != suppliers || parity_segments != suppliers {
            return Err(Error::InvalidEccMap(format!(
                "map for {} suppliers spans {} data and {} parity segments",
                suppliers, data_segments, parity_segments
            )));
        }

        let mut data_to_parity = vec![Vec::new(); data_segments];
        for (parity_num, group) in parity_to_data.iter().enumerate() {
            if group.is_empty() {
                return Err(Error::InvalidEccMap(format!(
                    "parity {} has no data members",
                    parity_num
                )));
            }
            for &data_num in group {
                data_to_parity[data_num].push(parity_num);
            }
        }
        for (data_num, parities) in data_to_parity.iter().enumerate() {
            if parities.is_empty() {
                return Err(Error::InvalidEccMap(format!(
                    "data segment {} is not covered by any parity",
                    data_num
                )));
            }
        }

        Ok(Self {
            suppliers,
            parity_to_data,
            data_to_parity,
            data_segments,
            parity_segments,
            correctable_errors: correctable_for(suppliers),
            fire_hire_errors: fire_hire_for(suppliers),
        })
    }

    pub fn suppliers(&self) -> usize {
        self.suppliers
    }

    pub fn data_segments(&self) -> usize {
        self.data_segments
    }

    pub fn parity_segments(&self) -> usize {
        self.parity_segments
    }

    /// How many simultaneous losses are always recoverable.
    pub fn correctable_errors(&self) -> usize {
        self.correctable_errors
    }

    /// Dead-supplier threshold for replacement decisions.
    pub fn fire_hire_errors(&self) -> usize {
        self.fire_hire_errors
    }

    /// How many good data segments always suffice to fix the rest.
    pub fn data_needed(&self) -> usize {
        self.data_segments - self.correctable_errors
    }

    /// Data members feeding parity segment `parity_num`.
    pub fn parity_group(&self, parity_num: usize) -> &[usize] {
        &self.parity_to_data[parity_num]
    }

    /// Parity segments that include data segment `data_num`.
    pub fn parities_of(&self, data_num: usize) -> &[usize] {
        &self.data_to_parity[data_num]
    }

    /// Full reachability check: can every missing data segment be
    /// reconstructed from what is present, applying parity groups
    /// transitively until a fixed point?
    pub fn fixable(&self, data: &[bool], parity: &[bool]) -> bool {
        if data.len() < self.data_segments || parity.len() < self.parity_segments {
            return false;
        }
        let mut have = data[..self.data_segments].to_vec();
        let mut still_missing = have.iter().filter(|present| !**present).count();
        let mut making_progress = true;
        while making_progress && still_missing > 0 {
            making_progress = false;
            for (parity_num, group) in self.parity_to_data.iter().enumerate() {
                if !parity[parity_num] {
                    continue;
                }
                let mut missing = 0;
                let mut last_missing = 0;
                for &data_num in group {
                    if !have[data_num] {
                        missing += 1;
                        last_missing = data_num;
                    }
                }
                if missing == 1 {
                    have[last_missing] = true;
                    still_missing -= 1;
                    making_progress = true;
                }
            }
        }
        still_missing == 0
    }

    /// Single-step check: is there at least one data segment recoverable
    /// right now, or one absent parity whose members are all present?
    /// Cheap gate before submitting a decode task.
    pub fn can_make_progress(&self, data: &[bool], parity: &[bool]) -> bool {
        if data.len() < self.data_segments || parity.len() < self.parity_segments {
            return false;
        }
        for (parity_num, group) in self.parity_to_data.iter().enumerate() {
            let missing = group.iter().filter(|&&data_num| !data[data_num]).count();
            if parity[parity_num] {
                if missing == 1 {
                    return true;
                }
            } else if missing == 0 {
                return true;
            }
        }
        false
    }

    /// Pick the parity group to reconstruct `missing_index` from: among
    /// present parities containing it with exactly one absent member, the
    /// one with the fewest data dependencies wins (first found on ties).
    /// Returns `None` when the segment is already present or no group
    /// qualifies yet.
    pub fn data_fix_path(
        &self,
        data: &[bool],
        parity: &[bool],
        missing_index: usize,
    ) -> Option<(usize, &[usize])> {
        if missing_index >= self.data_segments
            || data.len() < self.data_segments
            || parity.len() < self.parity_segments
            || data[missing_index]
        {
            return None;
        }
        let mut best: Option<(usize, &[usize])> = None;
        for (parity_num, group) in self.parity_to_data.iter().enumerate() {
            if !parity[parity_num] || !group.contains(&missing_index) {
                continue;
            }
            let missing = group.iter().filter(|&&data_num| !data[data_num]).count();
            if missing != 1 {
                continue;
            }
            let smaller = match best {
                Some((_, members)) => group.len() < members.len(),
                None => true,
            };
            if smaller {
                best = Some((parity_num, group.as_slice()));
            }
        }
        best
    }
}

impl fmt::Display for EccMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ecc/{}x{}", self.suppliers, self.suppliers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_creation() {
        for n in SUPPORTED_SUPPLIER_COUNTS {
            let map = EccMap::new(n).unwrap();
            assert_eq!(map.suppliers(), n);
            assert_eq!(map.data_segments(), n);
            assert_eq!(map.parity_segments(), n);
        }
        assert!(EccMap::new(0).is_err());
        assert!(EccMap::new(3).is_err());
        assert!(EccMap::new(65).is_err());
    }

    #[test]
    fn test_reverse_index() {
        let map = EccMap::new(4).unwrap();
        assert_eq!(map.parity_group(0), &[1, 2, 3]);
        assert_eq!(map.parities_of(0), &[1, 2, 3]);
        assert_eq!(map.parities_of(1), &[0, 3]);
        assert_eq!(map.parities_of(2), &[0, 1]);
        assert_eq!(map.parities_of(3), &[0, 2]);
    }

    #[test]
    fn test_error_budgets() {
        assert_eq!(EccMap::new(2).unwrap().correctable_errors(), 1);
        assert_eq!(EccMap::new(4).unwrap().correctable_errors(), 2);
        assert_eq!(EccMap::new(7).unwrap().correctable_errors(), 3);
        assert_eq!(EccMap::new(13).unwrap().correctable_errors(), 4);
        assert_eq!(EccMap::new(18).unwrap().correctable_errors(), 5);
        assert_eq!(EccMap::new(26).unwrap().correctable_errors(), 6);
        assert_eq!(EccMap::new(64).unwrap().correctable_errors(), 10);
        assert_eq!(EccMap::new(4).unwrap().data_needed(), 2);
        assert_eq!(EccMap::new(64).unwrap().fire_hire_errors(), 5);
    }

    #[test]
    fn test_fixable_one_data_missing() {
        let map = EccMap::new(4).unwrap();
        let data = [true, false, true, true];
        let parity = [true, true, true, false];
        assert!(map.fixable(&data, &parity));
    }

    #[test]
    fn test_fixable_is_transitive() {
        // Parity 0 frees data 1, which completes parity 3 for data 0.
        let map = EccMap::new(4).unwrap();
        let data = [false, false, true, true];
        let parity = [true, false, true, true];
        assert!(map.fixable(&data, &parity));
        assert!(map.can_make_progress(&data, &parity));
    }

    #[test]
    fn test_unfixable() {
        let map = EccMap::new(2).unwrap();
        let data = [false, false];
        let parity = [true, false];
        // Parity 0 covers only data 1; data 0 has no live group left.
        assert!(!map.fixable(&data, &parity));
    }

    #[test]
    fn test_fixable_nothing_missing() {
        let map = EccMap::new(7).unwrap();
        let data = [true; 7];
        let parity = [false; 7];
        assert!(map.fixable(&data, &parity));
    }

    #[test]
    fn test_can_make_progress_parity_rebuild() {
        let map = EccMap::new(2).unwrap();
        let data = [true, true];
        let parity = [false, true];
        assert!(map.can_make_progress(&data, &parity));
    }

    #[test]
    fn test_no_progress_when_complete_or_dead() {
        let map = EccMap::new(2).unwrap();
        // Everything present: nothing to do.
        assert!(!map.can_make_progress(&[true, true], &[true, true]));
        // Everything lost: nothing to do it with.
        assert!(!map.can_make_progress(&[false, false], &[false, false]));
    }

    #[test]
    fn test_data_fix_path_basic() {
        let map = EccMap::new(4).unwrap();
        let data = [true, false, true, true];
        let parity = [true, true, true, false];
        let (parity_num, members) = map.data_fix_path(&data, &parity, 1).unwrap();
        assert_eq!(parity_num, 0);
        assert_eq!(members, &[1, 2, 3]);
    }

    #[test]
    fn test_data_fix_path_prefers_smallest_group() {
        // In the 13-supplier map, parity 10 is the only 3-member group and
        // it contains data 6.
        let map = EccMap::new(13).unwrap();
        let mut data = [true; 13];
        data[6] = false;
        let parity = [true; 13];
        let (parity_num, members) = map.data_fix_path(&data, &parity, 6).unwrap();
        assert_eq!(parity_num, 10);
        assert_eq!(members, &[6, 7, 8]);
    }

    #[test]
    fn test_data_fix_path_none_cases() {
        let map = EccMap::new(2).unwrap();
        // Segment already present.
        assert!(map.data_fix_path(&[true, true], &[true, true], 0).is_none());
        // No parity alive.
        assert!(map
            .data_fix_path(&[false, true], &[false, false], 0)
            .is_none());
        // Out of range.
        assert!(map.data_fix_path(&[false, true], &[true, true], 9).is_none());
    }

    #[test]
    fn test_correctable_loss_of_whole_suppliers() {
        // Losing both fragments of the first `correctable_errors` suppliers
        // must still leave every map fixable.
        for n in SUPPORTED_SUPPLIER_COUNTS {
            let map = EccMap::new(n).unwrap();
            let lost = map.correctable_errors();
            let mut data = vec![true; n];
            let mut parity = vec![true; n];
            for slot in 0..lost {
                data[slot] = false;
                parity[slot] = false;
            }
            assert!(
                map.fixable(&data, &parity),
                "map {} not fixable after losing {} suppliers",
                map,
                lost
            );
        }
    }

    #[test]
    fn test_short_presence_vectors_rejected() {
        let map = EccMap::new(4).unwrap();
        assert!(!map.fixable(&[true, true], &[true, true, true, true]));
        assert!(!map.can_make_progress(&[true; 4], &[true; 2]));
        assert!(map.data_fix_path(&[false; 2], &[true; 4], 0).is_none());
    }
}
