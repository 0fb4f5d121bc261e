//! Height and speed value types.
//!
//! The desk reports height in tenths of a millimeter relative to its base
//! height, and speed in hundredths of a millimeter per second (signed,
//! negative = downward). These types carry the device-native value and
//! convert to human units (mm, mm/s) on demand.

/// Desk height. Internal value is tenths of a millimeter relative to the
/// base height that was in effect when the value was constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Height {
    value: i32,
    base_height: u16,
}

impl Height {
    /// Wrap a device-native value (tenths of a mm above `base_height`).
    pub fn from_internal(value: i32, base_height: u16) -> Self {
        Self { value, base_height }
    }

    /// Convert a human height in millimeters above the floor.
    pub fn from_human(mm: f64, base_height: u16) -> Self {
        Self {
            value: ((mm - base_height as f64) * 10.0).round() as i32,
            base_height,
        }
    }

    /// Device-native value.
    pub fn value(&self) -> i32 {
        self.value
    }

    /// Height in millimeters above the floor.
    pub fn human(&self) -> f64 {
        self.value as f64 / 10.0 + self.base_height as f64
    }
}

/// Desk movement speed. Internal value is hundredths of a mm/s, signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Speed {
    value: i16,
}

impl Speed {
    pub fn from_internal(value: i16) -> Self {
        Self { value }
    }

    pub fn from_human(mm_per_s: f64) -> Self {
        Self {
            value: (mm_per_s * 100.0).round() as i16,
        }
    }

    pub fn value(&self) -> i16 {
        self.value
    }

    /// Speed in millimeters per second.
    pub fn human(&self) -> f64 {
        self.value as f64 / 100.0
    }
}

/// Immutable telemetry snapshot, replaced wholesale on every event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightAndSpeed {
    pub height: Height,
    pub speed: Speed,
}

/// Render a human value the way the REST surface expects it: integral
/// values without a trailing ".0", everything else as-is.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_round_trip() {
        for internal in [0, 1, 995, 2600, 6553] {
            let height = Height::from_internal(internal, 640);
            let back = Height::from_human(height.human(), 640);
            assert!(
                (back.value() - internal).abs() <= 1,
                "internal {} round-tripped to {}",
                internal,
                back.value()
            );
        }
    }

    #[test]
    fn height_human_conversion() {
        let height = Height::from_human(900.0, 640);
        assert_eq!(height.value(), 2600);
        assert_eq!(height.human(), 900.0);
    }

    #[test]
    fn height_captures_base_height() {
        let height = Height::from_internal(1000, 640);
        assert_eq!(height.human(), 740.0);
        let other_base = Height::from_internal(1000, 680);
        assert_eq!(other_base.human(), 780.0);
    }

    #[test]
    fn speed_round_trip() {
        for human in [0.0, 0.01, 32.5, -45.75] {
            let speed = Speed::from_human(human);
            assert_eq!(speed.human(), human);
        }
    }

    #[test]
    fn negative_speed_means_downward() {
        let speed = Speed::from_internal(-3250);
        assert_eq!(speed.human(), -32.5);
    }

    #[test]
    fn format_number_drops_integral_fraction() {
        assert_eq!(format_number(740.0), "740");
        assert_eq!(format_number(32.5), "32.5");
        assert_eq!(format_number(-45.75), "-45.75");
    }
}
