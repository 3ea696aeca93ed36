use std::collections::{HashMap, HashSet, VecDeque};

use passpool_core::model::{GroupState, RiderInterest, UserId};

use crate::partition::partition;

/// Riders in the order handed to the partitioner: already grouped riders by
/// (group number, join order), then ungrouped riders first-come first-served.
pub fn rider_ordering(current: &[GroupState], interests: &[RiderInterest]) -> Vec<UserId> {
    let order = join_order(interests);
    let mut placed = HashSet::new();
    let mut ordering = Vec::with_capacity(interests.len());

    let mut groups: Vec<&GroupState> = current.iter().collect();
    groups.sort_by_key(|g| g.group.number);

    for state in groups {
        let mut members: Vec<UserId> = state
            .member_ids()
            .into_iter()
            .filter(|u| order.contains_key(u))
            .collect();
        members.sort_by_key(|u| order[u]);
        for user in members {
            if placed.insert(user) {
                ordering.push(user);
            }
        }
    }

    let mut waiting: Vec<UserId> = order
        .keys()
        .filter(|u| !placed.contains(*u))
        .copied()
        .collect();
    waiting.sort_by_key(|u| order[u]);
    ordering.extend(waiting);

    ordering
}

struct Survivor {
    number: u32,
    has_pass: bool,
    steward: Option<UserId>,
    members: Vec<UserId>,
}

/// Compute the target partition for a trip.
///
/// The partitioner decides how many groups there are and how large each one is.
/// Riders are then seated into that shape so that existing groups keep as many of
/// their members as the shape allows: groups holding pass proof are kept first,
/// then the largest ones; oversized groups release their latest joiners (never the
/// steward); released and waiting riders fill the free seats, existing groups first.
///
/// Kept groups come first in display order, new groups after them.
pub fn shape_target(current: &[GroupState], interests: &[RiderInterest]) -> Vec<Vec<UserId>> {
    let ordering = rider_ordering(current, interests);
    let canonical = partition(&ordering);
    if canonical.is_empty() {
        return canonical;
    }

    let order = join_order(interests);
    let position = |u: &UserId| order.get(u).copied().unwrap_or(usize::MAX);

    let mut groups: Vec<&GroupState> = current.iter().collect();
    groups.sort_by_key(|g| g.group.number);

    let mut seen = HashSet::new();
    let survivors: Vec<Survivor> = groups
        .into_iter()
        .filter_map(|state| {
            let mut members: Vec<UserId> = state
                .member_ids()
                .into_iter()
                .filter(|u| order.contains_key(u) && seen.insert(*u))
                .collect();
            members.sort_by_key(|u| position(u));
            if members.is_empty() {
                return None;
            }
            Some(Survivor {
                number: state.group.number,
                has_pass: state.group.has_pass_proof(),
                steward: state.group.steward_id.filter(|s| members.contains(s)),
                members,
            })
        })
        .collect();

    if survivors.is_empty() {
        return canonical;
    }

    // largest first
    let sizes: Vec<usize> = canonical.iter().map(Vec::len).collect();

    let mut ranked: Vec<usize> = (0..survivors.len()).collect();
    ranked.sort_by(|&a, &b| {
        let (sa, sb) = (&survivors[a], &survivors[b]);
        sb.has_pass
            .cmp(&sa.has_pass)
            .then(sb.members.len().cmp(&sa.members.len()))
            .then(sa.number.cmp(&sb.number))
    });
    ranked.truncate(sizes.len());

    let mut by_size = ranked.clone();
    by_size.sort_by(|&a, &b| {
        survivors[b]
            .members
            .len()
            .cmp(&survivors[a].members.len())
            .then(survivors[a].number.cmp(&survivors[b].number))
    });
    let slots: HashMap<usize, usize> = by_size
        .iter()
        .zip(sizes.iter())
        .map(|(&idx, &size)| (idx, size))
        .collect();
    let fresh_sizes = &sizes[by_size.len()..];

    let mut released: Vec<(u32, usize, UserId)> = Vec::new();
    let mut seats: Vec<(Vec<UserId>, usize)> = Vec::new();

    for (idx, survivor) in survivors.iter().enumerate() {
        match slots.get(&idx) {
            Some(&size) => {
                let mut retained = survivor.members.clone();
                let mut excess = retained.len().saturating_sub(size);
                let mut cursor = retained.len();
                while excess > 0 && cursor > 0 {
                    cursor -= 1;
                    if Some(retained[cursor]) != survivor.steward {
                        let user = retained.remove(cursor);
                        released.push((survivor.number, position(&user), user));
                        excess -= 1;
                    }
                }
                seats.push((retained, size));
            }
            None => {
                for user in &survivor.members {
                    released.push((survivor.number, position(user), *user));
                }
            }
        }
    }

    released.sort();
    let mut pool: VecDeque<UserId> = released.into_iter().map(|(_, _, u)| u).collect();
    pool.extend(ordering.iter().filter(|u| !seen.contains(*u)).copied());

    let mut target: Vec<Vec<UserId>> = Vec::with_capacity(sizes.len());
    for (mut members, size) in seats {
        while members.len() < size {
            match pool.pop_front() {
                Some(user) => members.push(user),
                None => break,
            }
        }
        target.push(members);
    }

    for &size in fresh_sizes {
        let take = size.min(pool.len());
        let members: Vec<UserId> = pool.drain(..take).collect();
        if !members.is_empty() {
            target.push(members);
        }
    }

    debug_assert!(pool.is_empty(), "riders left unseated");
    target
}

fn join_order(interests: &[RiderInterest]) -> HashMap<UserId, usize> {
    let mut sorted: Vec<&RiderInterest> = interests.iter().collect();
    sorted.sort_by(|a, b| (a.joined_at, a.user_id).cmp(&(b.joined_at, b.user_id)));
    sorted
        .into_iter()
        .enumerate()
        .map(|(idx, i)| (i.user_id, idx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};
    use passpool_core::model::{Group, Membership, PassProof};
    use passpool_shared::{Masked, TripId};
    use uuid::Uuid;

    fn trip() -> TripId {
        TripId::new("S 1", NaiveDate::from_ymd_opt(2026, 10, 20).unwrap())
    }

    fn riders(n: usize) -> (Vec<UserId>, Vec<RiderInterest>) {
        let start = Utc::now();
        let users: Vec<UserId> = (0..n).map(|_| Uuid::new_v4()).collect();
        let interests = users
            .iter()
            .enumerate()
            .map(|(i, u)| RiderInterest::new(trip(), *u, start + Duration::seconds(i as i64)))
            .collect();
        (users, interests)
    }

    fn group(number: u32, members: &[UserId]) -> GroupState {
        let now = Utc::now();
        let group = Group::new(trip(), number, 0, now);
        let members = members.iter().map(|u| Membership::new(group.id, *u, now)).collect();
        GroupState { group, members }
    }

    #[test]
    fn test_cold_start_matches_partition() {
        let (users, interests) = riders(7);
        let target = shape_target(&[], &interests);
        assert_eq!(target, vec![users[0..4].to_vec(), users[4..7].to_vec()]);
    }

    #[test]
    fn test_ordering_puts_grouped_riders_first() {
        let (users, interests) = riders(4);
        // user 3 is grouped, users 0..3 are waiting
        let current = vec![group(1, &[users[3]])];
        let ordering = rider_ordering(&current, &interests);
        assert_eq!(ordering, vec![users[3], users[0], users[1], users[2]]);
    }

    #[test]
    fn test_unchanged_riders_reproduce_groups() {
        let (users, interests) = riders(11);
        let current = vec![
            group(1, &users[0..4]),
            group(2, &users[4..8]),
            group(3, &users[8..11]),
        ];
        let target = shape_target(&current, &interests);
        assert_eq!(
            target,
            vec![users[0..4].to_vec(), users[4..8].to_vec(), users[8..11].to_vec()]
        );
    }

    #[test]
    fn test_removal_keeps_other_groups_intact() {
        let (users, mut interests) = riders(12);
        let current = vec![
            group(1, &users[0..4]),
            group(2, &users[4..8]),
            group(3, &users[8..12]),
        ];
        interests.retain(|i| i.user_id != users[5]);

        let target = shape_target(&current, &interests);
        assert_eq!(target[0], users[0..4].to_vec());
        assert_eq!(target[1], vec![users[4], users[6], users[7]]);
        assert_eq!(target[2], users[8..12].to_vec());
    }

    #[test]
    fn test_sixth_rider_splits_full_group() {
        let (users, interests) = riders(6);
        let current = vec![group(1, &users[0..5])];
        let target = shape_target(&current, &interests);
        assert_eq!(target, vec![users[0..3].to_vec(), users[3..6].to_vec()]);
    }

    #[test]
    fn test_steward_is_never_released() {
        let (users, interests) = riders(6);
        let mut full = group(1, &users[0..5]);
        full.group.steward_id = Some(users[4]);
        let target = shape_target(&[full], &interests);

        assert_eq!(target[0].len(), 3);
        assert!(target[0].contains(&users[4]));
    }

    #[test]
    fn test_pass_holding_group_is_kept() {
        let (users, interests) = riders(5);
        let mut small = group(2, &users[4..5]);
        small.group.pass = Some(PassProof {
            ticket_id: Masked::new("T-1".to_string()),
            ticket_hash: "abc".to_string(),
            activated_at: Utc::now(),
            screenshot_ref: None,
        });
        let current = vec![group(1, &users[0..4]), small];

        let target = shape_target(&current, &interests);
        assert_eq!(target.len(), 1);
        // the pass group's rider keeps their seat, the others move in
        assert_eq!(target[0][0], users[4]);
        assert_eq!(target[0].len(), 5);
    }

    #[test]
    fn test_leaving_merges_into_larger_group() {
        let (users, mut interests) = riders(5);
        let current = vec![group(1, &users[0..3]), group(2, &users[3..5])];
        interests.retain(|i| i.user_id != users[3]);

        let target = shape_target(&current, &interests);
        assert_eq!(target, vec![vec![users[0], users[1], users[2], users[4]]]);
    }
}
