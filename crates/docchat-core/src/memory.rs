//! Bounded context windows over a thread's history.
//!
//! Size is measured in characters of message content. The window keeps
//! the newest messages that fit, oldest first, and never splits a message.

use crate::models::Message;

/// Size of a message in budget units.
pub fn message_units(message: &Message) -> usize {
    message.content.chars().count()
}

/// The longest suffix of `messages` whose combined size fits `max_units`.
///
/// Walking back from the newest message stops at the first one that does
/// not fit, so the window is always a contiguous tail of the history.
pub fn context_window(messages: &[Message], max_units: usize) -> Vec<Message> {
    let mut used = 0usize;
    let mut first = messages.len();
    for (i, m) in messages.iter().enumerate().rev() {
        let units = message_units(m);
        if used + units > max_units {
            break;
        }
        used += units;
        first = i;
    }
    messages[first..].to_vec()
}
