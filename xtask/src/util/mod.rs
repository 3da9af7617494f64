pub mod cpulist;
pub mod repo;
