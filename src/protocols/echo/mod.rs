//! Echo application.
//!
//! Every reassembled message is sent back to its sender as a single frame
//! with the same opcode. Useful for:
//!
//! 1. **Conformance testing**: fuzzing clients such as Autobahn drive an echo
//!    endpoint and compare what comes back.
//!
//! 2. **Throughput testing**: measure framing and I/O cost without any
//!    application work in the way.
//!
//! 3. **Fragmentation checks**: a message sent in many fragments comes back
//!    as one frame, which makes reassembly bugs easy to spot.

pub mod handler;

pub use handler::EchoHandler;
