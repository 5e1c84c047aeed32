//! Comparison of a shard's mappings as recorded globally and locally
//!
//! Mappings from both sides that overlap, directly or through a chain of
//! overlaps, form one group. A group whose two sides hold exactly the same
//! mappings is consistent; every other group is a difference.

use crate::key::{ShardKey, ShardRange};
use crate::store::{MappingStatus, StoreMapping};

use super::MappingLocation;

/// One inconsistent group.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MappingGroup {
    pub location: MappingLocation,
    /// Covered span for range mappings.
    pub range: Option<ShardRange>,
    pub global: Vec<StoreMapping>,
    pub local: Vec<StoreMapping>,
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

type Signature<'a> = (uuid::Uuid, &'a ShardKey, Option<&'a ShardKey>, MappingStatus);

fn signature(mapping: &StoreMapping) -> Signature<'_> {
    (mapping.id, &mapping.min_value, mapping.max_value.as_ref(), mapping.status)
}

fn same_mappings(global: &[StoreMapping], local: &[StoreMapping]) -> bool {
    let mut a: Vec<Signature<'_>> = global.iter().map(signature).collect();
    let mut b: Vec<Signature<'_>> = local.iter().map(signature).collect();
    a.sort_by(|x, y| x.1.cmp(y.1).then(x.0.cmp(&y.0)));
    b.sort_by(|x, y| x.1.cmp(y.1).then(x.0.cmp(&y.0)));
    a == b
}

fn span(mappings: &[&StoreMapping]) -> Option<ShardRange> {
    let low = mappings.iter().map(|m| &m.min_value).min()?;
    let high = mappings.iter().map(|m| m.max_value.as_ref()).collect::<Option<Vec<_>>>()?;
    let high = high.into_iter().max()?;
    ShardRange::new(low.clone(), high.clone()).ok()
}

/// Group the mappings of one shard and return the inconsistent groups,
/// ordered by their lowest key.
pub(crate) fn compare_mappings(global: &[StoreMapping], local: &[StoreMapping]) -> Vec<MappingGroup> {
    let all: Vec<&StoreMapping> = global.iter().chain(local.iter()).collect();
    let mut sets = DisjointSet::new(all.len());

    // Sweep in key order. A mapping can only overlap earlier ones whose end
    // lies past its start, and the furthest-reaching earlier mapping is
    // enough to chain it into the right group.
    let mut order: Vec<usize> = (0..all.len()).collect();
    order.sort_by(|a, b| all[*a].min_value.cmp(&all[*b].min_value));
    let mut reach: Option<usize> = None;
    for i in order {
        if let Some(r) = reach {
            if all[r].overlaps(all[i]) {
                sets.union(r, i);
            }
        }
        reach = match reach {
            Some(r) if reaches_past(all[r], all[i]) => Some(r),
            _ => Some(i),
        };
    }

    let mut roots: Vec<usize> = Vec::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    for i in 0..all.len() {
        let root = sets.find(i);
        match roots.iter().position(|r| *r == root) {
            Some(pos) => members[pos].push(i),
            None => {
                roots.push(root);
                members.push(vec![i]);
            }
        }
    }

    let mut groups: Vec<MappingGroup> = members
        .into_iter()
        .filter_map(|indices| {
            let (g, l): (Vec<usize>, Vec<usize>) = indices.iter().copied().partition(|i| *i < global.len());
            let global_side: Vec<StoreMapping> = g.iter().map(|i| all[*i].clone()).collect();
            let local_side: Vec<StoreMapping> = l.iter().map(|i| all[*i].clone()).collect();
            if same_mappings(&global_side, &local_side) {
                return None;
            }
            let location = match (global_side.is_empty(), local_side.is_empty()) {
                (false, true) => MappingLocation::MappingInShardMapOnly,
                (true, false) => MappingLocation::MappingInShardOnly,
                _ => MappingLocation::MappingInShardMapAndShard,
            };
            let refs: Vec<&StoreMapping> = indices.iter().map(|i| all[*i]).collect();
            Some(MappingGroup {
                location,
                range: span(&refs),
                global: global_side,
                local: local_side,
            })
        })
        .collect();

    groups.sort_by(|a, b| lowest(a).cmp(&lowest(b)));
    groups
}

/// Upper end of a mapping's key span; a point covers only its own key.
fn extent(mapping: &StoreMapping) -> &ShardKey {
    mapping.max_value.as_ref().unwrap_or(&mapping.min_value)
}

/// Whether `a` covers at least every key past `b`'s start that `b` covers.
/// On equal ends a point wins, since its end is inclusive.
fn reaches_past(a: &StoreMapping, b: &StoreMapping) -> bool {
    match extent(a).cmp(extent(b)) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.is_point() || !b.is_point(),
    }
}

fn lowest(group: &MappingGroup) -> Option<&ShardKey> {
    group.global.iter().chain(group.local.iter()).map(|m| &m.min_value).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ShardLocation, ShardStatus, StoreShard};
    use uuid::Uuid;

    fn shard() -> StoreShard {
        StoreShard::new(Uuid::new_v4(), ShardLocation::new("srv", "s1"), ShardStatus::Online)
    }

    fn range(map: Uuid, low: i32, high: i32) -> StoreMapping {
        StoreMapping::range(map, &ShardRange::i32(low, high).unwrap(), shard(), MappingStatus::Online)
    }

    #[test]
    fn test_identical_sides_are_consistent() {
        let map = Uuid::new_v4();
        let a = range(map, 0, 10);
        let b = range(map, 10, 20);
        let groups = compare_mappings(&[a.clone(), b.clone()], &[b, a]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_one_sided_mappings() {
        let map = Uuid::new_v4();
        let global_only = range(map, 0, 10);
        let local_only = range(map, 20, 30);
        let groups = compare_mappings(&[global_only.clone()], &[local_only.clone()]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].location, MappingLocation::MappingInShardMapOnly);
        assert_eq!(groups[0].global, vec![global_only]);
        assert_eq!(groups[1].location, MappingLocation::MappingInShardOnly);
        assert_eq!(groups[1].range, Some(ShardRange::i32(20, 30).unwrap()));
    }

    #[test]
    fn test_chained_overlaps_form_one_group() {
        let map = Uuid::new_v4();
        // Global was split, local was not.
        let left = range(map, 0, 40);
        let right = range(map, 40, 100);
        let whole = range(map, 0, 100);
        let groups = compare_mappings(&[left, right], &[whole]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].location, MappingLocation::MappingInShardMapAndShard);
        assert_eq!(groups[0].global.len(), 2);
        assert_eq!(groups[0].range, Some(ShardRange::i32(0, 100).unwrap()));
    }

    #[test]
    fn test_status_difference_is_reported() {
        let map = Uuid::new_v4();
        let online = range(map, 0, 10);
        let offline = online.with_status(MappingStatus::Offline);
        let groups = compare_mappings(&[online], &[offline]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].location, MappingLocation::MappingInShardMapAndShard);
    }

    #[test]
    fn test_long_mapping_bridges_later_neighbours() {
        let map = Uuid::new_v4();
        // [0,100) locally spans three global pieces, and [5,6) sits inside it
        // without touching its sorted neighbours.
        let whole = range(map, 0, 100);
        let inner = range(map, 5, 6);
        let pieces = vec![range(map, 0, 10), range(map, 40, 50), range(map, 90, 100)];
        let groups = compare_mappings(&pieces, &[whole, inner]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].global.len(), 3);
        assert_eq!(groups[0].local.len(), 2);

        let apart = compare_mappings(&[range(map, 0, 10)], &[range(map, 10, 20)]);
        assert_eq!(apart.len(), 2);
    }

    #[test]
    fn test_equal_points_are_grouped() {
        let map = Uuid::new_v4();
        let global = StoreMapping::point(map, ShardKey::from_i32(7), shard(), MappingStatus::Online);
        let local = StoreMapping::point(map, ShardKey::from_i32(7), shard(), MappingStatus::Online);
        let other = StoreMapping::point(map, ShardKey::from_i32(8), shard(), MappingStatus::Online);
        let groups = compare_mappings(&[global, other.clone()], &[local, other]);
        // Same key, different ids; the point at 8 matches on both sides.
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].global.len(), 1);
        assert_eq!(groups[0].local.len(), 1);
    }

    #[test]
    fn test_points_have_no_span() {
        let map = Uuid::new_v4();
        let point = StoreMapping::point(map, ShardKey::from_i32(5), shard(), MappingStatus::Online);
        let groups = compare_mappings(&[], &[point]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].range, None);
    }
}
