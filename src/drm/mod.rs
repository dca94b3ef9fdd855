pub mod file;
pub mod ioctl;

pub use file::DrmFile;
