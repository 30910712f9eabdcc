/// Translate an inbound command into the control token the receiving
/// hardware understands. Matching is exact and case-sensitive; anything else
/// yields `None` and is dropped by the dispatcher.
pub fn lookup(command: &str) -> Option<&'static str> {
    match command {
        "FORWARD" => Some("W"),
        "LEFT" => Some("A"),
        "BACKWARD" => Some("S"),
        "RIGHT" => Some("D"),
        "ATTACK" => Some("Space"),
        _ => None,
    }
}
