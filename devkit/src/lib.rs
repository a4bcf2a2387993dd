/*!
# LNT DevKit - Test stubs for lnt-core

- `agent_stub`: an in-process device agent (axum) with scriptable answers
- `test_utils`: stub provisioner and a harness wiring a `DeviceManager` to a
  temporary inventory
*/

pub mod agent_stub;
pub mod test_utils;

pub use agent_stub::{unreachable_address, StubAgent};
pub use test_utils::{sample_run_config, StubProvisioner, TestHarness};
