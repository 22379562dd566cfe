use std::collections::VecDeque;

const WINDOW: usize = 10;

/// Mean over the most recent samples.
#[derive(Clone, Debug, Default)]
pub struct SmoothingFilter {
    samples: VecDeque<f64>,
}

impl SmoothingFilter {
    pub fn add(&mut self, sample: f64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn avg(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}
