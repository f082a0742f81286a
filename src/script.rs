//! Scripted games.
//!
//! A [`TurnScript`] is the pre-agreed sequence of moves both virtual players
//! follow. Neither side knows the other's internal state: a player only plays
//! turn `i` when the board shows one of its own pieces on `turn_at(i).from`.
//! Captures and promotions are never scripted.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{SimError, SimResult};

/// One scripted move between two board positions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptedMove {
    pub from: String,
    pub to: String,
}

impl ScriptedMove {
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Ordered, immutable list of scripted moves shared by every virtual user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnScript {
    moves: SmallVec<[ScriptedMove; 8]>,
}

impl Default for TurnScript {
    fn default() -> Self {
        Self::checkers_opening()
    }
}

impl TurnScript {
    #[must_use]
    pub fn new(moves: impl IntoIterator<Item = ScriptedMove>) -> Self {
        Self {
            moves: moves.into_iter().collect(),
        }
    }

    /// The four-move opening the load scripts have always used:
    /// C7→D8, F2→E1, C5→D6, F4→E3.
    #[must_use]
    pub fn checkers_opening() -> Self {
        Self::new([
            ScriptedMove::new("C7", "D8"),
            ScriptedMove::new("F2", "E1"),
            ScriptedMove::new("C5", "D6"),
            ScriptedMove::new("F4", "E3"),
        ])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Returns the move for turn `index`.
    ///
    /// # Errors
    ///
    /// [`SimError::TurnOutOfRange`] if `index >= len()`.
    pub fn turn_at(&self, index: usize) -> SimResult<&ScriptedMove> {
        self.moves.get(index).ok_or(SimError::TurnOutOfRange {
            index,
            len: self.moves.len(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptedMove> {
        self.moves.iter()
    }
}
