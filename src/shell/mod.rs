//! Shell process management.
//!
//! ttyhub sessions are always PTY-backed: the child shell runs as a session
//! leader with the PTY slave as its controlling terminal, which gives TUI
//! programs, `isatty()` detection, and terminal resize for free.

pub mod pty;
