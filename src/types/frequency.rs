//! Defines the time resolution of forecast series as returned by the provider.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Represents the resolution of a forecast series.
///
/// The provider returns one object per resolution (`"hourly"` and `"daily"`), each holding a
/// shared `time` array and one array per requested variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// One value per hour, timestamps formatted as `YYYY-MM-DDTHH:MM`.
    Hourly,
    /// One value per day, timestamps formatted as `YYYY-MM-DD`.
    Daily,
}

impl Frequency {
    pub const ALL: [Frequency; 2] = [Frequency::Hourly, Frequency::Daily];

    /// The key of this section in the provider payload and the query parameter name.
    pub fn section_key(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
        }
    }
}

/// Formats a `Frequency` using its payload section key.
///
/// # Examples
///
/// ```
/// use forecast_warehouse::Frequency;
///
/// assert_eq!(Frequency::Hourly.to_string(), "hourly");
/// assert_eq!(format!("{}", Frequency::Daily), "daily");
/// ```
impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.section_key())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            other => Err(format!("unknown frequency '{other}'")),
        }
    }
}
