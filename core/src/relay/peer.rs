// A relay peer and its reachability history

use crate::transport::Destination;
use std::collections::VecDeque;

/// A known peer with a bounded window of response samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPeer {
    destination: Destination,
    samples: VecDeque<bool>,
    window: usize,
}

impl RelayPeer {
    pub fn new(destination: Destination, window: usize) -> Self {
        Self {
            destination,
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    pub fn with_samples(destination: Destination, window: usize, samples: &[bool]) -> Self {
        let mut peer = Self::new(destination, window);
        for &sample in samples {
            peer.add_sample(sample);
        }
        peer
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    /// Record whether the peer answered a request; the oldest sample falls
    /// out once the window is full
    pub fn add_sample(&mut self, responded: bool) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(responded);
    }

    pub fn has_samples(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = bool> + '_ {
        self.samples.iter().copied()
    }

    /// Percentage of answered requests in the window. 100 for a new peer.
    pub fn reachability(&self) -> u32 {
        if self.samples.is_empty() {
            return 100;
        }
        let answered = self.samples.iter().filter(|&&s| s).count();
        (answered * 100 / self.samples.len()) as u32
    }

    /// Samples as a string of `0`/`1`, oldest first
    pub fn samples_string(&self) -> String {
        self.samples.iter().map(|&s| if s { '1' } else { '0' }).collect()
    }

    /// Parse a `0`/`1` sample string. `None` on any other character.
    pub fn parse_samples(text: &str) -> Option<Vec<bool>> {
        text.chars()
            .map(|c| match c {
                '1' => Some(true),
                '0' => Some(false),
                _ => None,
            })
            .collect()
    }
}
