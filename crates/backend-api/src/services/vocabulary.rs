//! Fixed string vocabularies stored in notification, rule and template rows.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Kind of a notification, shared with the rules that raise them.
    NotificationType {
        CostAlert => "COST_ALERT",
        UsageAlert => "USAGE_ALERT",
        BudgetWarning => "BUDGET_WARNING",
        System => "SYSTEM",
        Report => "REPORT",
    }
);

string_enum!(Channel {
    InApp => "IN_APP",
    Email => "EMAIL",
    Slack => "SLACK",
    Webhook => "WEBHOOK",
});

string_enum!(Priority {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
    Critical => "CRITICAL",
});

string_enum!(NotificationStatus {
    Pending => "PENDING",
    Delivered => "DELIVERED",
    Read => "READ",
    Cancelled => "CANCELLED",
});

string_enum!(
    /// Calendar period a budget resets on, in UTC.
    BudgetPeriod {
        Daily => "DAILY",
        Weekly => "WEEKLY",
        Monthly => "MONTHLY",
        Quarterly => "QUARTERLY",
        Yearly => "YEARLY",
    }
);
