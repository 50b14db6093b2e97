/// Outcome of feeding one delta through the matcher.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopDecision {
    pub text_to_emit: String,
    pub should_stop: bool,
}

/// Mid-stream truncation on literal stopping strings.
///
/// `accumulated` holds every byte of generated text seen so far and is never truncated.
/// `emitted` marks how much of it has been released downstream. A tail that could still grow
/// into a stopping string is held back until the next delta disambiguates it.
#[derive(Debug, Clone, Default)]
pub struct StoppingStringMatcher {
    stops: Vec<String>,
    max_stop_len: usize,
    accumulated: String,
    emitted: usize,
    stopped: bool,
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

impl StoppingStringMatcher {
    pub fn new<I, S>(stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stops: Vec<String> = stops
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        let max_stop_len = stops.iter().map(|s| s.len()).max().unwrap_or(0);
        Self {
            stops,
            max_stop_len,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        !self.stops.is_empty()
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated
    }

    /// Earliest match across all stopping strings; ties go to the first declared string.
    fn find_match(&self, search_from: usize) -> Option<usize> {
        let haystack = &self.accumulated[search_from..];
        let mut best: Option<usize> = None;
        for stop in &self.stops {
            if let Some(idx) = haystack.find(stop.as_str()) {
                if best.map_or(true, |b| idx < b) {
                    best = Some(idx);
                }
            }
        }
        best.map(|idx| idx + search_from)
    }

    /// Length of the longest tail of the accumulated text that is a proper prefix of a stop.
    fn pending_prefix_len(&self) -> usize {
        let mut longest = 0;
        for stop in &self.stops {
            for (boundary, _) in stop.char_indices().skip(1) {
                if boundary > longest && self.accumulated.ends_with(&stop[..boundary]) {
                    longest = boundary;
                }
            }
        }
        longest
    }

    pub fn push(&mut self, delta: &str) -> StopDecision {
        if self.stopped {
            return StopDecision {
                text_to_emit: String::new(),
                should_stop: true,
            };
        }
        if !self.is_active() {
            self.accumulated.push_str(delta);
            self.emitted = self.accumulated.len();
            return StopDecision {
                text_to_emit: delta.to_string(),
                should_stop: false,
            };
        }

        let previous_len = self.accumulated.len();
        self.accumulated.push_str(delta);

        // Nothing before this window matched earlier, so the scan can start just short of it.
        let search_from = floor_char_boundary(
            &self.accumulated,
            previous_len.saturating_sub(self.max_stop_len.saturating_sub(1)),
        );

        if let Some(match_idx) = self.find_match(search_from) {
            self.stopped = true;
            let text_to_emit = if match_idx > self.emitted {
                self.accumulated[self.emitted..match_idx].to_string()
            } else {
                String::new()
            };
            self.emitted = self.emitted.max(match_idx);
            return StopDecision {
                text_to_emit,
                should_stop: true,
            };
        }

        let safe_end = (self.accumulated.len() - self.pending_prefix_len()).max(self.emitted);
        let text_to_emit = self.accumulated[self.emitted..safe_end].to_string();
        self.emitted = safe_end;
        StopDecision {
            text_to_emit,
            should_stop: false,
        }
    }

    /// Releases any held-back tail once the stream has ended without a stop.
    pub fn finish(&mut self) -> String {
        if self.stopped || self.emitted >= self.accumulated.len() {
            return String::new();
        }
        let rest = self.accumulated[self.emitted..].to_string();
        self.emitted = self.accumulated.len();
        rest
    }
}

/// Cuts a complete (non-streamed) text at its first stopping string.
pub fn truncate_at_stop(text: &str, stops: &[String]) -> (String, bool) {
    let mut matcher = StoppingStringMatcher::new(stops.iter().cloned());
    let mut decision = matcher.push(text);
    if !decision.should_stop {
        decision.text_to_emit.push_str(&matcher.finish());
    }
    (decision.text_to_emit, decision.should_stop)
}
