/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Quorum fan-out and the node sets it fans out to.

pub mod nodes;

pub mod pool;

pub use nodes::{remote_quorum_num, total_quorum_num, StreamNodeSet};
pub use pool::{QuorumCheck, QuorumPolicy, QuorumPool, TaskOrigin, Tally};
