//! Unit newtypes shared by the compiler and the decoder.

macro_rules! unit {
    ($name: ident) => {
        #[derive(
            Debug,
            Default,
            Copy,
            Clone,
            PartialOrd,
            Ord,
            PartialEq,
            Eq,
            Hash,
            derive_more::Add,
            derive_more::Sub,
            derive_more::AddAssign,
            derive_more::SubAssign,
            derive_more::Sum,
            derive_more::FromStr,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const ZERO: $name = Self::new(0);

            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn into_u64(self) -> u64 {
                self.0
            }

            pub fn into_f64(self) -> f64 {
                self.0 as f64
            }
        }
    };
}

unit!(Nanosecs);

impl Nanosecs {
    pub fn into_duration(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0)
    }
}

impl std::fmt::Display for Nanosecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

unit!(Microsecs);

impl From<Microsecs> for Nanosecs {
    fn from(us: Microsecs) -> Self {
        Nanosecs::new(us.0 * 1_000)
    }
}

impl std::fmt::Display for Microsecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

unit!(Millisecs);

impl From<Millisecs> for Nanosecs {
    fn from(ms: Millisecs) -> Self {
        Nanosecs::new(ms.0 * 1_000_000)
    }
}

impl std::fmt::Display for Millisecs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

unit!(Bytes);

impl std::fmt::Display for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}B", self.0)
    }
}

unit!(Ticks);

impl std::fmt::Display for Ticks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ticks", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_to_nanosecs() {
        assert_eq!(Nanosecs::from(Microsecs::new(3)), Nanosecs::new(3_000));
        assert_eq!(Nanosecs::from(Millisecs::new(2)), Nanosecs::new(2_000_000));
    }

    #[test]
    fn units_parse_and_display() {
        assert_eq!("250".parse::<Millisecs>().unwrap(), Millisecs::new(250));
        assert_eq!(Nanosecs::new(1_500).to_string(), "1500ns");
        assert_eq!(Ticks::new(3).to_string(), "3 ticks");
        assert_eq!(
            Nanosecs::new(2_000).into_duration(),
            std::time::Duration::from_micros(2)
        );
    }
}
