//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use cowavl::{Config, Tree, Worker};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, once per test binary.
pub fn init_tracing() {
	TRACING.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}

/// A tree whose worker only runs when the test says so.
pub fn stepped<T>(config: Config) -> (Tree<T>, Worker<T>)
where
	T: Ord + Clone + Send + Sync + 'static,
{
	init_tracing();
	Tree::detached(config).expect("valid config")
}
