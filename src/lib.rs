//! Adaptive chapter prefetching for a manga reader: source rate modelling,
//! reading-speed tracking, and bounded page downloads.

pub mod backend;
