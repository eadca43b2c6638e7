/// Closed min/max range over model timestamps, in milliseconds.
///
/// Empty until the first value is added.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub fn new() -> Bounds {
        Bounds::default()
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none()
    }

    pub fn add_value(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn add_range(&mut self, start: f64, end: f64) {
        self.add_value(start);
        self.add_value(end);
    }

    pub fn merge(&mut self, other: &Bounds) {
        if let Some(min) = other.min {
            self.add_value(min);
        }
        if let Some(max) = other.max {
            self.add_value(max);
        }
    }

    /// Width of the range, 0.0 while empty.
    pub fn range(&self) -> f64 {
        match (self.min, self.max) {
            (Some(min), Some(max)) => max - min,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn empty_until_first_value() {
        let mut bounds = Bounds::new();
        assert!(bounds.is_empty());
        assert_eq!(bounds.range(), 0.0);
        bounds.add_value(3.0);
        assert_eq!(bounds.min, Some(3.0));
        assert_eq!(bounds.max, Some(3.0));
    }

    #[rstest]
    fn merge_extends_both_ends() {
        let mut a = Bounds::new();
        a.add_range(2.0, 5.0);
        let mut b = Bounds::new();
        b.add_range(-1.0, 3.0);
        a.merge(&b);
        assert_eq!(a.min, Some(-1.0));
        assert_eq!(a.max, Some(5.0));
        assert_eq!(a.range(), 6.0);
    }
}
