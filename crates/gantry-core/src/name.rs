//! Deterministic resource naming.
//!
//! Every backend derives container, task, snapshot, pod and network names
//! from `(task_uuid, step_uuid)` with these functions and nothing else.
//! Cleanup after a crash only has to recompute the names.

/// Name of the main container/task/job for a step.
pub fn step_ident(task_uuid: &str, step_uuid: &str) -> String {
    format!("{task_uuid}-{step_uuid}")
}

/// Name of the snapshot backing a step's container.
pub fn snapshot_name(ident: &str) -> String {
    format!("{ident}-snapshot")
}

/// Name of the shared per-workflow network.
pub fn network_name(task_uuid: &str) -> String {
    format!("{task_uuid}-net")
}

/// Name of the shared per-workflow environment object (config map).
pub fn env_name(task_uuid: &str) -> String {
    format!("{task_uuid}-env")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_pure_functions_of_ids() {
        assert_eq!(step_ident("t1", "s1"), "t1-s1");
        assert_eq!(step_ident("t1", "s1"), step_ident("t1", "s1"));
        assert_eq!(snapshot_name(&step_ident("t1", "s1")), "t1-s1-snapshot");
        assert_eq!(network_name("t1"), "t1-net");
        assert_eq!(env_name("t1"), "t1-env");
    }
}
