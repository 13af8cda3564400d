//! Text messages exchanged with clients.

/// Sent to every client when a press starts.
pub const DOWN: &str = "DOWN";

/// Client request to stop the browser and the server.
pub const EXIT: &str = "EXIT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Exit,
    /// Anything we do not understand; kept for logging.
    Unknown(String),
}

impl ClientCommand {
    /// Matching is exact: no trimming, case-sensitive.
    pub fn parse(text: &str) -> Self {
        if text == EXIT {
            ClientCommand::Exit
        } else {
            ClientCommand::Unknown(text.to_string())
        }
    }
}
