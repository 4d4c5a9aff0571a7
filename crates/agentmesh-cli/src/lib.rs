//! Library half of the `agentmesh` binary, so command logic can be
//! exercised from integration tests.

pub mod commands;
