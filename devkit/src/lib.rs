/*!
# nodewatch DevKit - stubs and helpers for testing the monitor

- Stub control-RPC agent (TCP JSON-RPC server with scripted replies)
- JSON fixture builders for node records and RPC envelopes
- `TestHarness` wrapping mock remote and local management APIs
*/

pub mod fixtures;
pub mod rpc_stub;
pub mod test_utils;

pub use fixtures::NodeBuilder;
pub use rpc_stub::{StubAgent, StubReply};
pub use test_utils::TestHarness;
