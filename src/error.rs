//! Error types and utilities.

use thiserror::Error;

/// The result of a patching operation.
pub type Result<T> = std::result::Result<T, Error>;

/// A flat result code covering every public operation.
///
/// The engine deliberately exposes a single level of failure detail; the
/// underlying OS errors are logged at the point of failure instead of being
/// threaded through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  /// The operation is not valid in the transaction's current state.
  #[error("operation invalid in the transaction's current state")]
  InvalidState,
  /// A symbol did not resolve, or its address is outside the known address space.
  #[error("symbol could not be resolved in any loaded module")]
  SymbolNotFound,
  /// The target function cannot hold the jump patch.
  #[error("target function is too small to patch")]
  FunctionBodyTooSmall,
  /// A requested trampoline cannot be constructed safely.
  #[error("cannot build a trampoline for the target function")]
  TrampolineCreationFailure,
  /// Changing page protections failed.
  #[error("memory protection change failed")]
  MemoryProtectionFailure,
  /// Installing the signal action or queueing the signal failed.
  #[error("signal installation or delivery failed")]
  SignalActionFailure,
  /// A peer thread could not be halted outside the patch ranges in time.
  #[error("timed out halting a peer thread outside the patch ranges")]
  TimedOut,
  /// An OS facility failed in a way the engine cannot attribute.
  #[error("unexpected system failure")]
  Unexpected,
}
