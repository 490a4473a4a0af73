//! Online deadlock detection. There is no separately materialized
//! wait-for graph: a cycle check walks the holder/waiter chains already
//! threaded through the arenas, the same structures `LockManager` uses to
//! grant and release locks.

use std::collections::HashSet;

use crate::arena::{JobArena, RequestArena, ResourceArena};
use crate::common::SlotId;

/// Would `requester_job` waiting on `target_resource` create a cycle in
/// the wait-for relation?
///
/// Walks from `target_resource`'s current holders, and transitively from
/// each holder job's own outstanding waiter/upgrader requests, to the
/// resources *those* depend on. If this walk ever reaches a request whose
/// job is `requester_job`, granting the wait would close a cycle.
///
/// Callers must hold whatever latches make the traversed chains stable for
/// the duration of the call: the target resource's group latch, plus the
/// job-arena monitor for cross-job waiter-chain reads.
pub fn introduces_deadlock(
    resources: &ResourceArena,
    requests: &RequestArena,
    jobs: &JobArena,
    requester_job: SlotId,
    target_resource: SlotId,
) -> bool {
    let mut visited_jobs: HashSet<SlotId> = HashSet::new();
    let mut pending_resources = vec![target_resource];

    while let Some(resource) = pending_resources.pop() {
        let mut holder_req = resources.get_last_holder(resource);
        while holder_req.is_some() {
            let holder_job = requests.get_job_slot(holder_req);
            if holder_job == requester_job {
                return true;
            }
            if visited_jobs.insert(holder_job) {
                collect_waited_resources(requests, jobs, holder_job, &mut pending_resources);
            }
            holder_req = requests.get_next_request(holder_req);
        }
    }

    false
}

/// Pushes every resource `job` is itself blocked on (as a waiter or an
/// upgrader) onto `out`, so the caller can keep walking the wait-for
/// relation transitively.
fn collect_waited_resources(
    requests: &RequestArena,
    jobs: &JobArena,
    job: SlotId,
    out: &mut Vec<SlotId>,
) {
    let mut waiter_req = jobs.get_last_waiter(job);
    while waiter_req.is_some() {
        out.push(requests.get_resource_id(waiter_req));
        waiter_req = requests.get_next_job_request(waiter_req);
    }

    let mut upgrader_req = jobs.get_last_upgrader(job);
    while upgrader_req.is_some() {
        out.push(requests.get_resource_id(upgrader_req));
        upgrader_req = requests.get_next_job_request(upgrader_req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Role;
    use std::time::Duration;

    struct Fixture {
        resources: ResourceArena,
        requests: RequestArena,
        jobs: JobArena,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                resources: ResourceArena::new(Duration::from_secs(60)),
                requests: RequestArena::new(Duration::from_secs(60)),
                jobs: JobArena::new(Duration::from_secs(60)),
            }
        }

        fn new_job(&self) -> SlotId {
            self.jobs.allocate_new(0)
        }

        fn new_resource(&self) -> SlotId {
            self.resources.allocate_new(1, 0)
        }

        /// Wires `job` as a holder of `resource` via an `X` request.
        fn add_holder(&self, resource: SlotId, job: SlotId) {
            use crate::matrix::LockMode;
            let req = self
                .requests
                .allocate_new(resource, job, LockMode::X, Role::Holder);
            let head = self.resources.get_last_holder(resource);
            self.requests.set_next_request(req, head);
            self.resources.set_last_holder(resource, req);

            let job_head = self.jobs.get_last_holder(job);
            self.requests.set_next_job_request(req, job_head);
            self.jobs.set_last_holder(job, req);
        }

        /// Wires `job` as a waiter on `resource` via an `X` request.
        fn add_waiter(&self, resource: SlotId, job: SlotId) {
            use crate::matrix::LockMode;
            let req = self
                .requests
                .allocate_new(resource, job, LockMode::X, Role::Waiter);
            let head = self.resources.get_first_waiter(resource);
            self.requests.set_next_request(req, head);
            self.resources.set_first_waiter(resource, req);

            let job_head = self.jobs.get_last_waiter(job);
            self.requests.set_next_job_request(req, job_head);
            self.jobs.set_last_waiter(job, req);
        }
    }

    #[test]
    fn no_cycle_when_holder_waits_on_nothing() {
        let f = Fixture::new();
        let resource = f.new_resource();
        let holder = f.new_job();
        f.add_holder(resource, holder);

        let requester = f.new_job();
        assert!(!introduces_deadlock(
            &f.resources,
            &f.requests,
            &f.jobs,
            requester,
            resource
        ));
    }

    #[test]
    fn direct_cycle_is_detected() {
        // job A holds resource R1 and waits on R2; job B holds R2 and is
        // the requester trying to acquire R1. Granting B's wait closes a
        // two-node cycle.
        let f = Fixture::new();
        let r1 = f.new_resource();
        let r2 = f.new_resource();
        let job_a = f.new_job();
        let job_b = f.new_job();

        f.add_holder(r1, job_a);
        f.add_waiter(r2, job_a);
        f.add_holder(r2, job_b);

        assert!(introduces_deadlock(
            &f.resources,
            &f.requests,
            &f.jobs,
            job_b,
            r1
        ));
    }

    #[test]
    fn transitive_cycle_through_three_jobs_is_detected() {
        // A holds R1, waits on R2. B holds R2, waits on R3. C holds R3 and
        // is the requester trying to acquire R1.
        let f = Fixture::new();
        let r1 = f.new_resource();
        let r2 = f.new_resource();
        let r3 = f.new_resource();
        let job_a = f.new_job();
        let job_b = f.new_job();
        let job_c = f.new_job();

        f.add_holder(r1, job_a);
        f.add_waiter(r2, job_a);
        f.add_holder(r2, job_b);
        f.add_waiter(r3, job_b);
        f.add_holder(r3, job_c);

        assert!(introduces_deadlock(
            &f.resources,
            &f.requests,
            &f.jobs,
            job_c,
            r1
        ));
    }

    #[test]
    fn unrelated_holder_chain_does_not_trigger_false_positive() {
        let f = Fixture::new();
        let r1 = f.new_resource();
        let r2 = f.new_resource();
        let job_a = f.new_job();
        let job_b = f.new_job();

        f.add_holder(r1, job_a);
        f.add_waiter(r2, job_a);
        f.add_holder(r2, job_b);

        let unrelated_requester = f.new_job();
        assert!(!introduces_deadlock(
            &f.resources,
            &f.requests,
            &f.jobs,
            unrelated_requester,
            r1
        ));
    }
}
