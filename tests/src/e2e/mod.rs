//! End-to-end runs over a byte-built fixture binary, asserting on the
//! `--format json` message stream.

mod pipeline;
