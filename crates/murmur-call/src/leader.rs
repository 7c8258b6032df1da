//! Coordination-free key-holder election.

/// Elect the key holder for a call: the lexicographically smallest user id.
///
/// Deterministic from the membership view alone, so every participant that
/// sees the same roster agrees on the holder without any extra round trips.
/// Views that briefly diverge converge on the next roster change.
pub fn elect_holder<'a, I>(participants: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    participants.into_iter().min()
}
