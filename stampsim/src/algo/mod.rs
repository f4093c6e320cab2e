pub mod parallel;

pub use parallel::process_array_in_parallel_chunks;
