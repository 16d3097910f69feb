// src/utils/system.rs: System functions

use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sysinfo::System;
use crate::config::defs::{RUN_ID_MAX, RUN_ID_MIN};


/// Determines number of cores that can be used for external tools
///
/// # Arguments
///
/// * `args_threads` - Thread count requested on the command line.
///
/// # Returns
///
/// usize: requested threads, capped at the physical core count
pub fn detect_cores(args_threads: usize) -> usize {
    let physical_cores = match System::physical_core_count() {
        Some(cores) => cores,
        None => {
            warn!("Could not detect physical cores; assuming 1");
            1
        }
    };
    physical_cores.min(args_threads).max(1)
}


/// Creates a project-wide RNG from the system entropy pool. Optional seed for
/// reproducibility.
///
/// # Arguments
///
///  * `seed` - Seed number that allows reproducible results.
///
/// # Returns
///
/// A StdRng
pub fn generate_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}


/// Eight-digit run id, used as the remote run directory name.
pub fn generate_run_id(rng: &mut StdRng) -> String {
    rng.random_range(RUN_ID_MIN..=RUN_ID_MAX).to_string()
}
