mod system;

pub use system::collect_system;
