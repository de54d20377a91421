use std::collections::VecDeque;

use crate::readings::SensorReading;

pub const LIVE_BUFFER_CAPACITY: usize = 50;

/// Sliding window of the most recent readings for live charts.
#[derive(Debug, Clone)]
pub struct LiveBuffer {
    readings: VecDeque<SensorReading>,
    capacity: usize,
}

impl LiveBuffer {
    pub fn new() -> Self {
        Self::with_capacity(LIVE_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entry once full.
    pub fn push(&mut self, reading: SensorReading) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<SensorReading> {
        self.readings.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }

    pub fn latest(&self) -> Option<&SensorReading> {
        self.readings.back()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}
