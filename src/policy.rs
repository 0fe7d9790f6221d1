//! Injected triage policy: priority heuristics, category keywords and
//! deadline offsets.
//!
//! The keyword, VIP and automated-sender lists are business configuration. They
//! are read from a TOML file (see [`PolicyTable::load`]) and compiled once into a
//! [`TriagePolicy`]; the normalizer consults the compiled form on every call, so
//! editing the file and restarting reclassifies every ticket on the next sync.

use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::{normalize_email, Priority, TicketCategory};

/// Upper bound on an SLA offset: one hundred years.
pub const MAX_SLA_HOURS: i64 = 24 * 365 * 100;
/// Upper bound on a follow-up offset: one hundred years.
pub const MAX_DUE_DAYS: i64 = 365 * 100;

/// Per-priority numeric setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTable {
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

impl PriorityTable {
    #[must_use]
    pub const fn get(&self, priority: Priority) -> i64 {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

/// Keywords suggesting a category for a new ticket, checked in field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryKeywords {
    pub rent_arrears: Vec<String>,
    pub maintenance: Vec<String>,
    pub compliance: Vec<String>,
    pub leasing: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for CategoryKeywords {
    fn default() -> Self {
        Self {
            rent_arrears: strings(&[
                "rent overdue",
                "arrears",
                "behind on rent",
                "late rent",
                "payment plan",
                "unpaid rent",
                "notice to vacate",
            ]),
            maintenance: strings(&[
                "leak",
                "plumber",
                "toilet",
                "shower",
                "hot water",
                "aircon",
                "air con",
                "electrician",
                "mould",
                "broken",
                "repair",
                "maintenance",
            ]),
            compliance: strings(&[
                "smoke alarm",
                "gas compliance",
                "electrical safety",
                "compliance check",
                "council",
                "inspection",
            ]),
            leasing: strings(&[
                "lease renewal",
                "renewal",
                "lease extended",
                "fixed term",
                "rent increase",
                "increase notice",
            ]),
        }
    }
}

/// Raw policy as written in the TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    /// Case-insensitive substrings that mark a message urgent.
    pub urgent_keywords: Vec<String>,
    /// Full addresses, or `@domain` entries matching a whole domain.
    pub vip_senders: Vec<String>,
    /// Case-insensitive regexes matched against the sender address.
    pub automated_senders: Vec<String>,
    /// SLA offset in hours from the last message.
    pub sla_hours: PriorityTable,
    /// Follow-up deadline in days from the last message.
    pub due_days: PriorityTable,
    pub category_keywords: CategoryKeywords,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            urgent_keywords: strings(&[
                "urgent",
                "asap",
                "emergency",
                "immediately",
                "leak",
                "flood",
                "no heat",
                "no hot water",
                "legal notice",
            ]),
            vip_senders: Vec::new(),
            automated_senders: strings(&[
                r"^no-?reply@",
                r"^do-?not-?reply@",
                r"^mailer-daemon@",
                r"^notifications?@",
                r"^bounces?[+@]",
            ]),
            sla_hours: PriorityTable {
                high: 4,
                medium: 24,
                low: 72,
            },
            due_days: PriorityTable {
                high: 0,
                medium: 2,
                low: 3,
            },
            category_keywords: CategoryKeywords::default(),
        }
    }
}

impl PolicyTable {
    /// Read a policy file. Missing keys fall back to the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read policy {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid policy {}: {e}", path.display())))
    }
}

/// Compiled policy used by the normalizer.
#[derive(Debug, Clone)]
pub struct TriagePolicy {
    urgent_keywords: Vec<String>,
    vip_addresses: Vec<String>,
    vip_domains: Vec<String>,
    automated: Vec<Regex>,
    sla_hours: PriorityTable,
    due_days: PriorityTable,
    categories: Vec<(TicketCategory, Vec<String>)>,
}

fn keywords(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|k| text.contains(k.as_str()))
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self::compile(&PolicyTable::default()).expect("built-in policy compiles")
    }
}

impl TriagePolicy {
    /// Validate and compile a raw policy table.
    pub fn compile(table: &PolicyTable) -> Result<Self> {
        let automated = table
            .automated_senders
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| Error::Config(format!("bad automated sender pattern {pattern:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        for priority in Priority::ALL {
            let hours = table.sla_hours.get(*priority);
            if !(0..=MAX_SLA_HOURS).contains(&hours) {
                return Err(Error::Config(format!(
                    "sla_hours.{} = {hours} outside 0..={MAX_SLA_HOURS}",
                    priority.as_str().to_lowercase()
                )));
            }
            let days = table.due_days.get(*priority);
            if !(0..=MAX_DUE_DAYS).contains(&days) {
                return Err(Error::Config(format!(
                    "due_days.{} = {days} outside 0..={MAX_DUE_DAYS}",
                    priority.as_str().to_lowercase()
                )));
            }
        }

        let (vip_domains, vip_addresses): (Vec<String>, Vec<String>) = table
            .vip_senders
            .iter()
            .map(|s| normalize_email(s))
            .filter(|s| !s.is_empty())
            .partition(|s| s.starts_with('@'));

        let kw = &table.category_keywords;
        Ok(Self {
            urgent_keywords: keywords(&table.urgent_keywords),
            vip_addresses,
            vip_domains,
            automated,
            sla_hours: table.sla_hours,
            due_days: table.due_days,
            categories: vec![
                (TicketCategory::RentArrears, keywords(&kw.rent_arrears)),
                (TicketCategory::Maintenance, keywords(&kw.maintenance)),
                (TicketCategory::Compliance, keywords(&kw.compliance)),
                (TicketCategory::Leasing, keywords(&kw.leasing)),
            ],
        })
    }

    /// Classify a message from its sender and text parts (subject, snippet,
    /// body). Urgency wins over the automated-sender downgrade.
    #[must_use]
    pub fn classify(&self, sender: Option<&str>, texts: &[&str]) -> Priority {
        let sender = sender.map(normalize_email).unwrap_or_default();
        if self.is_vip(&sender) || texts.iter().any(|t| self.is_urgent(t)) {
            Priority::High
        } else if self.is_automated(&sender) {
            Priority::Low
        } else {
            Priority::Medium
        }
    }

    /// Category whose keywords appear first in list order; `GENERAL` otherwise.
    #[must_use]
    pub fn suggest_category(&self, texts: &[&str]) -> TicketCategory {
        let text = texts.join("\n").to_lowercase();
        self.categories
            .iter()
            .find(|(_, words)| contains_any(&text, words))
            .map_or(TicketCategory::General, |(category, _)| *category)
    }

    pub fn sla_due_at(&self, priority: Priority, last_message_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Duration::try_hours(self.sla_hours.get(priority))
            .and_then(|offset| last_message_at.checked_add_signed(offset))
            .ok_or_else(|| Error::Malformed(format!("SLA deadline overflows from {last_message_at}")))
    }

    pub fn due_at(&self, priority: Priority, last_message_at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Duration::try_days(self.due_days.get(priority))
            .and_then(|offset| last_message_at.checked_add_signed(offset))
            .ok_or_else(|| {
                Error::Malformed(format!("follow-up deadline overflows from {last_message_at}"))
            })
    }

    fn is_urgent(&self, text: &str) -> bool {
        !text.is_empty() && contains_any(&text.to_lowercase(), &self.urgent_keywords)
    }

    fn is_vip(&self, sender: &str) -> bool {
        if sender.is_empty() {
            return false;
        }
        self.vip_addresses.iter().any(|a| a == sender)
            || self.vip_domains.iter().any(|d| sender.ends_with(d.as_str()))
    }

    fn is_automated(&self, sender: &str) -> bool {
        !sender.is_empty() && self.automated.iter().any(|re| re.is_match(sender))
    }
}
