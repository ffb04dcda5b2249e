//! Hard-link detection.

use std::collections::HashMap;
use std::sync::Mutex;

/// Remembers the first path seen for each (device, inode) pair within one
/// run.
///
/// The first registration of a pair returns `None`; every later one
/// returns the first path, which the walker records as the hard-link
/// target. Pairs are independent: a shared inode number on two devices,
/// or two inodes on one device, never collide.
#[derive(Debug, Default)]
pub struct LinkResolver {
    seen: Mutex<HashMap<(u64, u64), String>>,
}

impl LinkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path` for (`device`, `inode`), returning the previously
    /// registered path if there is one.
    pub fn register(&self, device: u64, inode: u64, path: &str) -> Option<String> {
        let mut seen = self.seen.lock().unwrap();
        match seen.get(&(device, inode)) {
            Some(first) => Some(first.clone()),
            None => {
                seen.insert((device, inode), path.to_string());
                None
            }
        }
    }
}
