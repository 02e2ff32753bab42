use crate::event::Source;

/// Classifies dev-server output lines into framework tags.
///
/// The detector locks onto the first framework signature it sees; once
/// locked, every later line inherits the tag. A command hint can pre-lock
/// the detector before any output arrives.
#[derive(Debug, Default)]
pub struct FrameworkDetector {
    locked: Option<Source>,
}

impl FrameworkDetector {
    pub fn new() -> Self {
        Self { locked: None }
    }

    /// Pre-lock from the dev command line, when it names a framework.
    pub fn from_command(cmd: &str) -> Self {
        Self {
            locked: detect_from_command(cmd),
        }
    }

    pub fn locked(&self) -> Option<Source> {
        self.locked
    }

    /// Tag one output line.
    ///
    /// Unlocked plain output (no signature, no URL) classifies as `vite`
    /// without locking, so unambiguous early startup text stays coherent
    /// until a real signature arrives.
    pub fn classify_line(&mut self, text: &str) -> Source {
        let lower = text.to_lowercase();
        if lower.contains("next.js") || lower.contains("next dev") || lower.contains("compiled /") {
            self.locked = Some(Source::Next);
            return Source::Next;
        }
        if text.contains("VITE") || text.contains("vite") || text.contains("➜ Local:") {
            self.locked = Some(Source::Vite);
            return Source::Vite;
        }
        if let Some(locked) = self.locked {
            return locked;
        }
        if text.contains("http://") || text.contains("https://") {
            self.locked = Some(Source::DevServer);
            return Source::DevServer;
        }
        Source::Vite
    }
}

/// Command hint: `next` or `vite` as a whole word anywhere in the command.
pub fn detect_from_command(cmd: &str) -> Option<Source> {
    let has_word = |word: &str| {
        cmd.split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == word)
    };
    if has_word("next") {
        Some(Source::Next)
    } else if has_word("vite") {
        Some(Source::Vite)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_signatures_lock_the_detector() {
        for line in [
            "ready - started server on Next.js 14.1",
            "running next dev",
            "Compiled / in 312ms",
            "NEXT.JS compiled successfully",
        ] {
            let mut detector = FrameworkDetector::new();
            assert_eq!(detector.classify_line(line), Source::Next, "line: {line}");
            assert_eq!(detector.locked(), Some(Source::Next));
        }
    }

    #[test]
    fn vite_signatures_lock_the_detector() {
        for line in ["  VITE v5.0.11  ready in 350 ms", "vite building for production", "  ➜ Local:   http://localhost:5173/"] {
            let mut detector = FrameworkDetector::new();
            assert_eq!(detector.classify_line(line), Source::Vite, "line: {line}");
            assert_eq!(detector.locked(), Some(Source::Vite));
        }
    }

    #[test]
    fn next_wins_when_both_signatures_appear() {
        let mut detector = FrameworkDetector::new();
        assert_eq!(
            detector.classify_line("Next.js dev server behind vite proxy"),
            Source::Next
        );
    }

    #[test]
    fn locked_tag_carries_to_plain_lines() {
        let mut detector = FrameworkDetector::new();
        detector.classify_line("Compiled / in 100ms");
        assert_eq!(detector.classify_line("plain log line"), Source::Next);
        assert_eq!(
            detector.classify_line("listening on http://localhost:3000"),
            Source::Next
        );
    }

    #[test]
    fn bare_url_locks_to_devserver() {
        let mut detector = FrameworkDetector::new();
        assert_eq!(
            detector.classify_line("Server listening at http://127.0.0.1:8080"),
            Source::DevServer
        );
        assert_eq!(detector.locked(), Some(Source::DevServer));
        assert_eq!(detector.classify_line("still going"), Source::DevServer);
    }

    // Tie-break for unlocked, unmarked stdout: the hub-side default is
    // `vite`, and the fallback does not lock.
    #[test]
    fn unlocked_plain_output_defaults_to_vite() {
        let mut detector = FrameworkDetector::new();
        assert_eq!(detector.classify_line("warming up..."), Source::Vite);
        assert_eq!(detector.locked(), None);
        assert_eq!(
            detector.classify_line("Server at https://localhost:3000"),
            Source::DevServer
        );
    }

    #[test]
    fn command_hint_detects_whole_words_only() {
        assert_eq!(detect_from_command("npx next dev"), Some(Source::Next));
        assert_eq!(detect_from_command("pnpm vite --port 5173"), Some(Source::Vite));
        assert_eq!(detect_from_command("npm run nextgen"), None);
        assert_eq!(detect_from_command("invite-service start"), None);
        assert_eq!(detect_from_command("python -m http.server"), None);
    }

    #[test]
    fn command_hint_pre_locks() {
        let mut detector = FrameworkDetector::from_command("next dev --turbo");
        assert_eq!(detector.locked(), Some(Source::Next));
        assert_eq!(detector.classify_line("plain output"), Source::Next);
    }
}
