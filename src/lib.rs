#[macro_use]
extern crate error_chain;

pub mod admin;
pub mod autoscaler;
pub mod bookie;
pub mod cluster;
pub mod config;
pub mod crd;
pub mod decommission;
pub mod exec;
pub mod manager;
pub mod scheduler;

pub mod errors {
    use std::time::Duration;

    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Kube(kube::Error);
            Yaml(serde_yaml::Error);
        }

        errors {
            FatalConfig(msg: String) {
                description("invalid autoscaler configuration")
                display("invalid autoscaler configuration: {}", msg)
            }
            ShuttingDown {
                description("task scheduler is shutting down")
                display("task scheduler is shutting down")
            }
            ExecTimeout(pod: String, timeout: Duration) {
                description("command in pod timed out")
                display("command in pod {} timed out after {:?}", pod, timeout)
            }
            ExecFailed(pod: String, msg: String) {
                description("command in pod failed")
                display("command in pod {} failed: {}", pod, msg)
            }
            RecoveryFailed(node: String, output: String) {
                description("ledger recovery failed")
                display("ledger recovery for {} failed: {}", node, output)
            }
            UnexpectedResponse(node: String, msg: String) {
                description("unexpected response from bookie")
                display("unexpected response from {}: {}", node, msg)
            }
        }
    }

    /// How the scheduler should treat the result of a run or a scheduling request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum CycleOutcome {
        Ok,
        TransientFailure,
        FatalConfig,
        ShuttingDown,
    }

    impl CycleOutcome {
        pub fn of<T>(res: &Result<T>) -> Self {
            match res {
                Ok(_) => CycleOutcome::Ok,
                Err(e) => match e.kind() {
                    ErrorKind::FatalConfig(_) => CycleOutcome::FatalConfig,
                    ErrorKind::ShuttingDown => CycleOutcome::ShuttingDown,
                    _ => CycleOutcome::TransientFailure,
                },
            }
        }
    }

}

/*
Scaling the bookie fleet:

- Grow: a declarative replica change on the BookKeeper resource. The reconciler
  that owns the StatefulSet creates the pods.

- Shrink: never just lower the count. The highest ordinals are quarantined
  (read-only), their ledgers re-replicated, and only once nothing is
  under-replicated and the bookie owns no ledgers is the cookie deleted.
  The replica count then drops by the number of bookies that got that far.
*/
