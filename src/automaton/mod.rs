//! The user automaton contract and its engine-side decoration.

pub mod checker;
pub mod context;
pub mod decorated;

pub use checker::StateHashChecker;
pub use context::{current_mutation_info, AmbientMutationInfo, MutationContext};
pub use decorated::DecoratedAutomaton;

use crate::error::Result;
use crate::types::{RecoveryAction, Reign};
use std::io::{Read, Write};

/// The user-supplied deterministic state machine.
///
/// `apply_mutation` must be a pure function of the automaton state and the
/// mutation context: identical inputs on every peer must produce identical
/// state and identical RNG consumption. A handler that cannot proceed must
/// panic; the engine treats apply-time failures as fatal to the cell's
/// determinism and aborts rather than letting peers diverge.
pub trait Automaton: Send {
  fn apply_mutation(&mut self, context: &mut MutationContext);

  /// Serializes the full state. In the no-fork build path this runs on the
  /// automaton context and must not block on anything but `output`.
  fn save_snapshot(&self, output: &mut dyn Write) -> Result<()>;

  fn load_snapshot(&mut self, input: &mut dyn Read) -> Result<()>;

  /// Drops all state.
  fn clear(&mut self);

  /// Resets to the canonical empty state (sequence number zero).
  fn set_zero_state(&mut self);

  fn current_reign(&self) -> Reign {
    0
  }

  fn recovery_action_for_reign(&self, _reign: Reign) -> RecoveryAction {
    RecoveryAction::None
  }
}
