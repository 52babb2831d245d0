//! Small building blocks for thread-based concurrent programs.
//!
//! (if you're looking for data parallelism, check out [`rayon`] instead; if you need to run large
//! numbers of I/O tasks concurrently, you're probably better served by an `async` runtime)
//!
//! # Overview
//!
//! This library features two independent types: [`TaskGroup`] and [`SyncMap`].
//!
//! ## Task groups
//!
//! [`TaskGroup`] runs fallible work units on their own threads and joins them again. Waiting on
//! the group returns the first failure. In addition, any number of subscribers can ask for a
//! channel that receives *every* failure, so no error is lost just because another one happened
//! first.
//!
//! Subscribers are served independently: every failure is sent to every subscriber on its own
//! thread, so a subscriber that stops reading will not hold up the work units or the other
//! subscribers. [`TaskGroup::wait`] makes sure all of those sends have completed before it
//! closes the subscriptions.
//!
//! If a work unit panics, the panic is forwarded to the thread that calls [`TaskGroup::wait`],
//! as if the work had been performed there directly.
//!
//! ## Synchronized maps
//!
//! [`SyncMap`] is a [`HashMap`][std::collections::HashMap] behind a single reader-writer lock.
//! It is usable straight from [`SyncMap::new`] (a `const fn`, so it also works in a `static`),
//! returns its keys in sorted order from [`SyncMap::keys`], and can be cloned or exported into a
//! plain map without aliasing its storage.
//!
//! # Usage
//!
//! Run a few work units and inspect every failure:
//!
//! ```
//! use syncgroup::TaskGroup;
//!
//! let group = TaskGroup::builder().name("checks").build();
//! let errors = group.subscribe();
//! let collector = std::thread::spawn(move || errors.iter().collect::<Vec<String>>());
//!
//! for i in 0..4 {
//!     group.go(move || {
//!         if i % 2 == 0 {
//!             Err(format!("check {i} failed"))
//!         } else {
//!             Ok(())
//!         }
//!     }).unwrap();
//! }
//!
//! let first = group.wait().unwrap_err();
//! let mut all = collector.join().unwrap();
//! all.sort();
//! assert!(all.contains(&first));
//! assert_eq!(all, ["check 0 failed", "check 2 failed"]);
//! ```
//!
//! Fill a [`SyncMap`] from several work units:
//!
//! ```
//! use std::sync::Arc;
//! use syncgroup::{SyncMap, TaskGroup};
//!
//! let squares = Arc::new(SyncMap::new());
//! let group = TaskGroup::<()>::new();
//! for n in [3u64, 1, 2] {
//!     let squares = squares.clone();
//!     group.go(move || {
//!         squares.set(n, n * n);
//!         Ok(())
//!     }).unwrap();
//! }
//! group.wait().unwrap();
//!
//! assert_eq!(squares.keys(), [1, 2, 3]);
//! assert_eq!(squares.get(&3), Some(9));
//! ```
//!
//! [`rayon`]: https://crates.io/crates/rayon

mod error;
mod group;
mod map;
mod sync;

pub use error::GroupError;
pub use group::{Phase, TaskGroup, TaskGroupBuilder};
pub use map::SyncMap;
