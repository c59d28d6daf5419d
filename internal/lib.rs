pub mod access_log;
pub mod cache;
pub mod fs;
pub mod s3;
pub mod sync;
pub mod util;

#[cfg(test)]
pub mod test_support;
