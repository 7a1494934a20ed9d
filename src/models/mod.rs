mod pvp;
mod state;
mod user;

pub use pvp::{
    CancelResponse, FinalScores, ForfeitResponse, Match, MatchAnswer, MatchDetailResponse,
    MatchResponse, MatchStatus, TaskView,
};
pub use state::AppState;
pub use user::{PlayerInfo, User};
