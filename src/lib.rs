pub mod densemap;
pub mod executor;
pub mod graph;
pub mod load;
pub mod output;
pub mod parse;
pub mod poller;
pub mod process;
pub mod progress;
pub mod smallmap;
pub mod work;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
