//! Game outcomes, including the graded mobility tie-break.
//!
//! A game that reaches the fifty-move cap or a repetition is not scored as a
//! plain draw. Instead the side that most restricted its opponent's mobility
//! earns a grade:
//!
//! - `G1.0` is the steepest grade (opponent had one legal move and was in check)
//! - `G1.5` one legal move, not in check
//! - ... down to `G9.5` (nine legal moves, not in check)
//!
//! Together with wins and stalemates this gives a total order from Black's
//! best outcome to White's best outcome, with a plain draw in the middle.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Neg;

use chess::Color;

use crate::constants::MOBILITY_LIMIT;

/// One step on the mobility ladder. Index 0 is `G1.0`, index 17 is `G9.5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MobilityGrade(u8);

impl MobilityGrade {
    /// Number of grades on the ladder.
    pub const COUNT: u8 = 18;

    /// Grade for a position where the restricted side had `legal_moves` moves.
    ///
    /// Returns `None` outside `1..=9`: zero moves is mate or stalemate, ten or
    /// more earns nothing.
    pub fn new(legal_moves: usize, in_check: bool) -> Option<Self> {
        if legal_moves == 0 || legal_moves >= MOBILITY_LIMIT {
            return None;
        }
        Some(Self(2 * (legal_moves as u8 - 1) + u8::from(!in_check)))
    }

    pub fn from_index(index: u8) -> Option<Self> {
        (index < Self::COUNT).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn legal_moves(self) -> usize {
        usize::from(self.0 / 2) + 1
    }

    pub fn in_check(self) -> bool {
        self.0 % 2 == 0
    }

    /// Value magnitude: 0.25 for `G1.0`, halving at every step.
    pub fn magnitude(self) -> f32 {
        0.25 / (1u32 << self.0) as f32
    }
}

impl fmt::Display for MobilityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let half = if self.in_check() { 0 } else { 5 };
        write!(f, "G{}.{}", self.legal_moves(), half)
    }
}

/// Outcome of a game, or `Undecided` while it goes on.
///
/// Stalemate and mobility results name the side that is credited, i.e. the
/// side that left its opponent without (enough) moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameResult {
    Undecided,
    WhiteWon,
    BlackWon,
    WhiteStalemate,
    BlackStalemate,
    Draw,
    Mobility { winner: Color, grade: MobilityGrade },
}

impl GameResult {
    pub fn won_by(winner: Color) -> Self {
        match winner {
            Color::White => GameResult::WhiteWon,
            Color::Black => GameResult::BlackWon,
        }
    }

    pub fn stalemate_for(winner: Color) -> Self {
        match winner {
            Color::White => GameResult::WhiteStalemate,
            Color::Black => GameResult::BlackStalemate,
        }
    }

    /// Result credited to `winner` for restricting the opponent to
    /// `legal_moves` moves.
    pub fn from_mobility(winner: Color, legal_moves: usize, in_check: bool) -> Self {
        if legal_moves == 0 {
            return if in_check {
                Self::won_by(winner)
            } else {
                Self::stalemate_for(winner)
            };
        }
        match MobilityGrade::new(legal_moves, in_check) {
            Some(grade) => GameResult::Mobility { winner, grade },
            None => GameResult::Draw,
        }
    }

    pub fn is_decided(self) -> bool {
        self != GameResult::Undecided
    }

    /// Side credited with this result, if any.
    pub fn winner(self) -> Option<Color> {
        match self {
            GameResult::WhiteWon | GameResult::WhiteStalemate => Some(Color::White),
            GameResult::BlackWon | GameResult::BlackStalemate => Some(Color::Black),
            GameResult::Mobility { winner, .. } => Some(winner),
            GameResult::Undecided | GameResult::Draw => None,
        }
    }

    /// Position on the total order, from White's point of view.
    ///
    /// `WhiteWon` is 20, `WhiteStalemate` 19, White `G1.0`..`G9.5` are 18..1,
    /// `Draw` is 0 and Black mirrors below. `Undecided` has no rank.
    pub fn white_rank(self) -> Option<i8> {
        let magnitude = match self {
            GameResult::Undecided => return None,
            GameResult::Draw => return Some(0),
            GameResult::WhiteWon | GameResult::BlackWon => 20,
            GameResult::WhiteStalemate | GameResult::BlackStalemate => 19,
            GameResult::Mobility { grade, .. } => 18 - grade.index() as i8,
        };
        match self.winner() {
            Some(Color::Black) => Some(-magnitude),
            _ => Some(magnitude),
        }
    }

    /// Value in `[-1, 1]` from White's point of view.
    ///
    /// Wins are 1, stalemates 0.5 and mobility grades shrink towards (but
    /// never reach) the draw value 0. `Undecided` maps to 0.
    pub fn white_value(self) -> f32 {
        let magnitude = match self {
            GameResult::Undecided | GameResult::Draw => return 0.0,
            GameResult::WhiteWon | GameResult::BlackWon => 1.0,
            GameResult::WhiteStalemate | GameResult::BlackStalemate => 0.5,
            GameResult::Mobility { grade, .. } => grade.magnitude(),
        };
        match self.winner() {
            Some(Color::Black) => -magnitude,
            _ => magnitude,
        }
    }

    /// Value from `side`'s point of view.
    pub fn value_for(self, side: Color) -> f32 {
        match side {
            Color::White => self.white_value(),
            Color::Black => -self.white_value(),
        }
    }
}

impl PartialOrd for GameResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.white_rank(), other.white_rank()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            (None, None) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl Neg for GameResult {
    type Output = GameResult;

    /// Swap colours.
    fn neg(self) -> GameResult {
        match self {
            GameResult::WhiteWon => GameResult::BlackWon,
            GameResult::BlackWon => GameResult::WhiteWon,
            GameResult::WhiteStalemate => GameResult::BlackStalemate,
            GameResult::BlackStalemate => GameResult::WhiteStalemate,
            GameResult::Mobility { winner, grade } => GameResult::Mobility { winner: !winner, grade },
            other => other,
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let score = match self.winner() {
            Some(Color::White) => "1-0",
            Some(Color::Black) => "0-1",
            None if *self == GameResult::Draw => "1/2-1/2",
            None => return write!(f, "*"),
        };
        match self {
            GameResult::WhiteStalemate | GameResult::BlackStalemate => write!(f, "{score} (stalemate)"),
            GameResult::Mobility { grade, .. } => write!(f, "{score} ({grade})"),
            _ => write!(f, "{score}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_decided() -> Vec<GameResult> {
        let mut results = vec![GameResult::BlackWon, GameResult::BlackStalemate];
        for index in 0..MobilityGrade::COUNT {
            let grade = MobilityGrade::from_index(index).expect("in range");
            results.push(GameResult::Mobility { winner: Color::Black, grade });
        }
        results.push(GameResult::Draw);
        for index in (0..MobilityGrade::COUNT).rev() {
            let grade = MobilityGrade::from_index(index).expect("in range");
            results.push(GameResult::Mobility { winner: Color::White, grade });
        }
        results.push(GameResult::WhiteStalemate);
        results.push(GameResult::WhiteWon);
        results
    }

    #[test]
    fn test_total_order_is_strict() {
        let results = all_decided();
        assert_eq!(results.len(), 41);
        for pair in results.windows(2) {
            assert!(pair[0] < pair[1], "{} should rank below {}", pair[0], pair[1]);
            assert!(pair[0].white_value() < pair[1].white_value());
        }
    }

    #[test]
    fn test_undecided_is_unordered() {
        assert_eq!(GameResult::Undecided.partial_cmp(&GameResult::Draw), None);
        assert_eq!(GameResult::Undecided.white_rank(), None);
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(MobilityGrade::new(0, true), None);
        assert_eq!(MobilityGrade::new(10, false), None);
        let steepest = MobilityGrade::new(1, true).expect("G1.0");
        assert_eq!(steepest.index(), 0);
        assert_eq!(steepest.to_string(), "G1.0");
        let mildest = MobilityGrade::new(9, false).expect("G9.5");
        assert_eq!(mildest.index(), MobilityGrade::COUNT - 1);
        assert_eq!(mildest.to_string(), "G9.5");
        assert_eq!(MobilityGrade::new(3, false).map(|g| g.to_string()), Some("G3.5".to_string()));
    }

    #[test]
    fn test_from_mobility_edges() {
        assert_eq!(GameResult::from_mobility(Color::White, 0, true), GameResult::WhiteWon);
        assert_eq!(GameResult::from_mobility(Color::Black, 0, false), GameResult::BlackStalemate);
        assert_eq!(GameResult::from_mobility(Color::White, 10, false), GameResult::Draw);
    }

    #[test]
    fn test_values_match_ladder() {
        assert_eq!(GameResult::WhiteWon.white_value(), 1.0);
        assert_eq!(GameResult::BlackStalemate.white_value(), -0.5);
        let g1 = GameResult::from_mobility(Color::White, 1, true);
        assert_eq!(g1.white_value(), 0.25);
        let g95 = GameResult::from_mobility(Color::White, 9, false);
        assert!((g95.white_value() - 0.000_001_907_349).abs() < 1e-9);
        assert!(g95.white_value() > 0.0);
        assert_eq!(g1.value_for(Color::Black), -0.25);
    }

    #[test]
    fn test_neg_swaps_colours() {
        for result in all_decided() {
            assert_eq!((-result).white_rank(), result.white_rank().map(|r| -r));
        }
        assert_eq!(-GameResult::Undecided, GameResult::Undecided);
    }

    #[test]
    fn test_display() {
        assert_eq!(GameResult::WhiteWon.to_string(), "1-0");
        assert_eq!(GameResult::Draw.to_string(), "1/2-1/2");
        assert_eq!(GameResult::BlackStalemate.to_string(), "0-1 (stalemate)");
        assert_eq!(GameResult::from_mobility(Color::White, 2, false).to_string(), "1-0 (G2.5)");
        assert_eq!(GameResult::Undecided.to_string(), "*");
    }
}
