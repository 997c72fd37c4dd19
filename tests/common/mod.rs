//! Shared test support for the integration test binaries.

#![allow(dead_code)]
