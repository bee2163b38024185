// arr-test-utils: Shared test utilities for the orchestration suite.
//
// Provides a mock upstream HTTP server speaking the /api/v3 dialect
// surface, for integration testing of sync, dispatch, and health flows.

pub mod mock_upstream;

pub use mock_upstream::MockUpstream;
