//! Placement scheduler.
//!
//! Fills every job that wants more copies (`nodes.len() < want`) onto
//! willing nodes (`job not already placed there, cost fits the node's
//! free capacity`). Each run takes a fresh pseudo-random permutation of
//! the nodes and round-robins across it, placing at most one job per
//! node per turn, so no node ordering can starve another. The run ends
//! when a whole pass places nothing or no fillable job remains.
//!
//! Placements go through the ordinary `AddLink` path, so they coalesce
//! into the diff log and persist idempotently on the next commit.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::data::{DataState, Op};

impl DataState {
    /// One scheduler pass with a fresh random permutation.
    pub fn schedule(&mut self) {
        self.schedule_with(&mut rand::thread_rng());
    }

    /// One scheduler pass with a caller-supplied source of randomness.
    pub fn schedule_with<R: Rng>(&mut self, rng: &mut R) {
        if self.nodes.is_empty() || self.jobs.is_empty() {
            return;
        }
        // candidate window over the jobs, in id order; full jobs are
        // trimmed from the head as they fill up
        let cand: Vec<u64> = self.jobs.keys().copied().collect();
        let mut head = 0;
        while !self.jobs[&cand[head]].runnable() {
            head += 1;
            if head == cand.len() {
                return;
            }
        }
        debug!("scheduler starting");
        let mut perm: Vec<u64> = self.nodes.keys().copied().collect();
        perm.shuffle(rng);
        // lastmod remembers the last node that took a job; coming around
        // to it again without placing anything means we are done
        let mut lastmod: Option<usize> = None;
        'outer: loop {
            for i in 0..perm.len() {
                if lastmod == Some(i) {
                    break 'outer;
                }
                let node_id = perm[i];
                let chosen = cand[head..].iter().copied().find(|jid| {
                    let job = &self.jobs[jid];
                    job.runnable() && self.nodes[&node_id].can_run(job)
                });
                let Some(job_id) = chosen else { continue };
                self.apply(Op::AddLink { job: job_id, node: node_id });
                lastmod = Some(i);
                while !self.jobs[&cand[head]].runnable() {
                    head += 1;
                    if head == cand.len() {
                        break 'outer;
                    }
                }
            }
            // no node took anything on the very first pass
            if lastmod.is_none() {
                break;
            }
        }
        debug!("scheduler done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{test_job, test_node, Diff};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1)
    }

    #[test]
    fn empty_catalogs_do_nothing() {
        let mut s = DataState::default();
        s.schedule_with(&mut rng());
        assert!(s.diffs.is_empty());
        assert!(s.results.is_empty());
    }

    #[test]
    fn single_node_takes_one_copy() {
        // want 2, but only one node exists: exactly one link
        let mut s = DataState::default();
        s.apply(Op::AddNode(test_node(7, 10)));
        s.apply(Op::AddJob(test_job(1, 3, 2)));
        s.diffs.clear();
        s.schedule_with(&mut rng());
        s.assert_invariants();
        assert_eq!(s.jobs[&1].nodes, vec![7]);
        assert_eq!(s.nodes[&7].used, 3);
        assert_eq!(s.nodes[&7].jobs.len(), 1);
        assert_eq!(s.diffs, vec![Diff::AddLink { job: 1, node: 7 }]);
    }

    #[test]
    fn capacity_limits_placement() {
        // node capacity 5, two jobs of cost 3: only one fits
        let mut s = DataState::default();
        s.apply(Op::AddNode(test_node(7, 5)));
        s.apply(Op::AddJob(test_job(1, 3, 1)));
        s.apply(Op::AddJob(test_job(2, 3, 1)));
        s.schedule_with(&mut rng());
        s.assert_invariants();
        assert_eq!(s.nodes[&7].used, 3);
        let placed: usize = s.jobs.values().map(|j| j.nodes.len()).sum();
        assert_eq!(placed, 1);
    }

    #[test]
    fn fills_want_across_nodes() {
        let mut s = DataState::default();
        for id in 1..=3 {
            s.apply(Op::AddNode(test_node(id, 10)));
        }
        s.apply(Op::AddJob(test_job(1, 2, 3)));
        s.schedule_with(&mut rng());
        s.assert_invariants();
        let mut nodes = s.jobs[&1].nodes.clone();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![1, 2, 3]);
    }

    #[test]
    fn never_exceeds_want() {
        let mut s = DataState::default();
        for id in 1..=5 {
            s.apply(Op::AddNode(test_node(id, 10)));
        }
        s.apply(Op::AddJob(test_job(1, 1, 2)));
        s.schedule_with(&mut rng());
        assert_eq!(s.jobs[&1].nodes.len(), 2);
        // a second run changes nothing
        let diffs_before = s.diffs.len();
        s.schedule_with(&mut rng());
        assert_eq!(s.jobs[&1].nodes.len(), 2);
        assert_eq!(s.diffs.len(), diffs_before);
    }

    #[test]
    fn round_robin_spreads_load() {
        // three nodes, three jobs of equal cost: one each
        let mut s = DataState::default();
        for id in 1..=3 {
            s.apply(Op::AddNode(test_node(id, 4)));
        }
        for id in 1..=3 {
            s.apply(Op::AddJob(test_job(id, 4, 1)));
        }
        s.schedule_with(&mut rng());
        s.assert_invariants();
        for n in s.nodes.values() {
            assert_eq!(n.jobs.len(), 1, "node {} took {} jobs", n.id, n.jobs.len());
        }
    }

    #[test]
    fn already_full_jobs_are_skipped() {
        let mut s = DataState::default();
        s.apply(Op::AddNode(test_node(1, 10)));
        s.apply(Op::AddNode(test_node(2, 10)));
        s.apply(Op::AddJob(test_job(1, 1, 1)));
        s.apply(Op::AddLink { job: 1, node: 1 });
        let diffs_before = s.diffs.len();
        s.schedule_with(&mut rng());
        assert_eq!(s.diffs.len(), diffs_before, "full job was rescheduled");
    }

    #[test]
    fn oversized_job_is_never_placed() {
        let mut s = DataState::default();
        s.apply(Op::AddNode(test_node(1, 2)));
        s.apply(Op::AddJob(test_job(1, 5, 1)));
        s.schedule_with(&mut rng());
        s.assert_invariants();
        assert!(s.jobs[&1].nodes.is_empty());
        assert_eq!(s.nodes[&1].used, 0);
    }

    #[test]
    fn many_random_worlds_stay_invariant() {
        use rand::Rng as _;
        let mut seed_rng = StdRng::seed_from_u64(99);
        for _ in 0..30 {
            let mut s = DataState::default();
            let nodes = seed_rng.gen_range(0..6);
            let jobs = seed_rng.gen_range(0..8);
            for id in 0..nodes {
                s.apply(Op::AddNode(test_node(id, seed_rng.gen_range(0..10))));
            }
            for id in 0..jobs {
                s.apply(Op::AddJob(test_job(
                    id,
                    seed_rng.gen_range(1..5),
                    seed_rng.gen_range(0..4),
                )));
            }
            let mut rng = StdRng::seed_from_u64(seed_rng.gen());
            s.schedule_with(&mut rng);
            s.assert_invariants();
        }
    }
}
