//! Conditional orders, trading accounts and the order status machine.
//!
//! `waiting` is the only state the scheduler selects; every other status is
//! terminal and [`ConditionalOrder::transition`] refuses to leave it.

use crate::domain::error::StoreError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Defines a string-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "invalid {} '{}' (expected one of: {})",
                        stringify!($name),
                        other,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

string_enum!(
    OrderStatus {
        Waiting => "waiting",
        Opened => "opened",
        Closed => "closed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

string_enum!(Side { Buy => "buy", Sell => "sell" });

string_enum!(
    PositionSide {
        Long => "long",
        Short => "short",
        Net => "net",
    }
);

string_enum!(MarginType { Cross => "cross", Isolated => "isolated" });

string_enum!(
    /// How `size` is denominated: contracts, or quote currency to convert
    /// at the order price.
    SizeType {
        Contracts => "contracts",
        Quote => "quote",
    }
);

string_enum!(OrderType { Limit => "limit", Market => "market" });

string_enum!(OrderAction { Open => "open", Close => "close" });

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        self != OrderStatus::Waiting
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalOrder {
    pub id: i64,
    pub account_id: i64,
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub margin_type: MarginType,
    pub price: f64,
    pub size: f64,
    pub size_type: SizeType,
    pub order_type: OrderType,
    /// Empty means the order is unconditionally due.
    pub condition: String,
    pub exchange_order_id: Option<String>,
    pub action: OrderAction,
    pub status: OrderStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConditionalOrder {
    /// A new market order in `waiting` with no condition; id 0 until stored.
    pub fn new(account_id: i64, symbol: impl Into<String>, side: Side, size: f64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            account_id,
            symbol: symbol.into(),
            side,
            position_side: match side {
                Side::Buy => PositionSide::Long,
                Side::Sell => PositionSide::Short,
            },
            margin_type: MarginType::Cross,
            price: 0.0,
            size,
            size_type: SizeType::Contracts,
            order_type: OrderType::Market,
            condition: String::new(),
            exchange_order_id: None,
            action: OrderAction::Open,
            status: OrderStatus::Waiting,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_action(mut self, action: OrderAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_limit_price(mut self, price: f64) -> Self {
        self.order_type = OrderType::Limit;
        self.price = price;
        self
    }

    pub fn has_condition(&self) -> bool {
        !self.condition.trim().is_empty()
    }

    /// Move to `to`, recording `message`. Only `waiting` may be left.
    pub fn transition(
        &mut self,
        to: OrderStatus,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        if self.status.is_terminal() || to == OrderStatus::Waiting {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.message = message.into();
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub name: String,
    /// Exchange kind, resolved through the exchange hub (e.g. `paper`).
    pub exchange: String,
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
    pub testnet: bool,
}

impl Account {
    pub fn new(id: i64, name: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            exchange: exchange.into(),
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: String::new(),
            testnet: false,
        }
    }
}
