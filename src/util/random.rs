use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;

use rand::Rng;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for picking among pending messages, abstracted so tests can make the
///  pick deterministic
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    fn gen_usize_range(range: Range<usize>) -> usize;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_usize_range(range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }
}
