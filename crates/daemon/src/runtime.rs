//! Process-wide collaborators, constructed once at startup and passed into
//! every subsystem that needs them.

use std::sync::Arc;

use crate::process::{ProcessRunner, SystemRunner};

#[derive(Clone)]
pub struct Runtime {
    pub process: Arc<dyn ProcessRunner>,
}

impl Runtime {
    pub fn system() -> Self {
        Runtime {
            process: Arc::new(SystemRunner),
        }
    }

    pub fn with_runner(process: Arc<dyn ProcessRunner>) -> Self {
        Runtime { process }
    }
}
