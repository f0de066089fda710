use crate::adapters::ChatChunk;

/// Splits an inline "thinking" channel out of a single upstream text
/// stream. Providers mark the channel with literal sentinel tokens that
/// arrive as whole chunks; the sentinels themselves are swallowed.
///
/// NOT_STARTED --open--> THINKING --close--> COMPLETED
#[derive(Debug, Clone)]
pub struct ReasoningSplitter {
    open: String,
    close: String,
    state: SplitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    NotStarted,
    Thinking,
    Completed,
}

impl ReasoningSplitter {
    /// `tag` is the bare tag name, e.g. "think" for `<think>`/`</think>`.
    pub fn new(tag: &str) -> Self {
        Self {
            open: format!("<{tag}>"),
            close: format!("</{tag}>"),
            state: SplitState::NotStarted,
        }
    }

    /// Classify one upstream text delta. Returns None when the chunk was a
    /// sentinel and must not be forwarded.
    pub fn feed(&mut self, delta: String) -> Option<ChatChunk> {
        match self.state {
            SplitState::NotStarted => {
                if delta == self.open {
                    self.state = SplitState::Thinking;
                    None
                } else {
                    Some(ChatChunk::Text(delta))
                }
            }
            SplitState::Thinking => {
                if delta == self.close {
                    self.state = SplitState::Completed;
                    None
                } else {
                    Some(ChatChunk::Reasoning(delta))
                }
            }
            SplitState::Completed => Some(ChatChunk::Text(delta)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tag: &str, input: &[&str]) -> Vec<ChatChunk> {
        let mut splitter = ReasoningSplitter::new(tag);
        input
            .iter()
            .filter_map(|s| splitter.feed(s.to_string()))
            .collect()
    }

    #[test]
    fn splits_thinking_channel_and_swallows_sentinels() {
        let out = run("think", &["<think>", "step one", "</think>", "answer"]);
        assert_eq!(
            out,
            vec![
                ChatChunk::Reasoning("step one".to_string()),
                ChatChunk::Text("answer".to_string()),
            ]
        );
    }

    #[test]
    fn stream_without_sentinels_is_plain_text() {
        let out = run("think", &["hello", " world"]);
        assert_eq!(
            out,
            vec![
                ChatChunk::Text("hello".to_string()),
                ChatChunk::Text(" world".to_string()),
            ]
        );
    }

    #[test]
    fn channel_can_open_after_leading_text() {
        let out = run("think", &["hi", "<think>", "more", "</think>", "tail"]);
        assert_eq!(
            out,
            vec![
                ChatChunk::Text("hi".to_string()),
                ChatChunk::Reasoning("more".to_string()),
                ChatChunk::Text("tail".to_string()),
            ]
        );
    }

    #[test]
    fn second_open_tag_after_completion_is_plain_text() {
        let out = run("think", &["<think>", "a", "</think>", "<think>"]);
        assert_eq!(
            out,
            vec![
                ChatChunk::Reasoning("a".to_string()),
                ChatChunk::Text("<think>".to_string()),
            ]
        );
    }

    #[test]
    fn unclosed_thinking_keeps_classifying_as_reasoning() {
        let out = run("think", &["<think>", "a", "b"]);
        assert_eq!(
            out,
            vec![
                ChatChunk::Reasoning("a".to_string()),
                ChatChunk::Reasoning("b".to_string()),
            ]
        );
    }
}
