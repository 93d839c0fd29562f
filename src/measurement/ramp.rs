//! Voltage ramp sequences.

/// Tolerance absorbing floating point error when counting steps.
const STEP_EPSILON: f64 = 1e-9;

/// Evenly stepped sequence from `begin` to `end`, both inclusive.
///
/// The sign of the step is chosen toward `end`. Values are computed as
/// `begin + i * step`, so errors do not accumulate, and the last value is
/// exactly `end` even when the distance is not a multiple of the step.
#[derive(Debug, Clone)]
pub struct LinearRange {
    begin: f64,
    end: f64,
    step: f64,
    steps: usize,
    index: usize,
}

impl LinearRange {
    /// Steps from `begin` to `end` with magnitude `step`.
    pub fn new(begin: f64, end: f64, step: f64) -> Self {
        let distance = end - begin;
        let magnitude = step.abs();
        let steps = if distance.abs() < STEP_EPSILON {
            0
        } else if !(magnitude > 0.0) || !magnitude.is_finite() {
            1
        } else {
            ((distance.abs() / magnitude) - STEP_EPSILON).ceil().max(1.0) as usize
        };
        Self {
            begin,
            end,
            step: magnitude.copysign(distance),
            steps,
            index: 0,
        }
    }

    /// First value.
    pub fn begin(&self) -> f64 {
        self.begin
    }

    /// Last value.
    pub fn end(&self) -> f64 {
        self.end
    }
}

impl Iterator for LinearRange {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.index > self.steps {
            return None;
        }
        let value = if self.index == self.steps {
            self.end
        } else {
            self.begin + self.index as f64 * self.step
        };
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.steps + 1).saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for LinearRange {}
