//! RFC 5322 reply construction, acknowledgement drafts and reminder digests.

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{Address, Message};
use std::fmt::Write as _;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Priority, Ticket, TicketCategory};

/// Settings key holding the reply signature.
pub const SIGNATURE_KEY: &str = "signature_text";

/// An in-thread reply to a ticket's sender.
#[derive(Debug, Clone, Default)]
pub struct Reply<'a> {
    pub from: &'a str,
    pub to_email: &'a str,
    pub to_name: Option<&'a str>,
    pub subject: &'a str,
    pub body: &'a str,
    /// `Message-ID` of the message being answered.
    pub in_reply_to: Option<&'a str>,
    /// `Message-ID`s of the thread, oldest first.
    pub references: Vec<&'a str>,
    pub signature: Option<&'a str>,
}

/// `Re: ` prefixed subject, without stacking prefixes.
#[must_use]
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Body with the signature appended below a standard delimiter.
#[must_use]
pub fn with_signature(body: &str, signature: Option<&str>) -> String {
    match signature.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sig) => format!("{}\n\n-- \n{sig}\n", body.trim_end()),
        None => body.to_string(),
    }
}

fn address(value: &str) -> Result<Address> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidInput(format!("invalid address '{value}': {e}")))
}

/// Category-aware acknowledgement for a ticket as `(subject, body)`.
///
/// High priority tickets promise review "as a priority".
#[must_use]
pub fn acknowledgement(ticket: &Ticket) -> (String, String) {
    let subject = match ticket.subject.trim() {
        "" => "(no subject)",
        s => s,
    };
    let first_name = ticket
        .from_name
        .as_deref()
        .and_then(|n| n.split_whitespace().next())
        .unwrap_or("there");

    let middle = match ticket.category {
        TicketCategory::Maintenance => {
            "We have received your maintenance request and will review it shortly. \
             If you can confirm your preferred access times (and whether pets are on site), \
             we can progress this faster."
        }
        TicketCategory::Compliance => {
            "We have received your message regarding compliance and will review the details shortly. \
             We will be in touch if we require any further information to arrange access."
        }
        TicketCategory::RentArrears => {
            "We have received your message regarding rent and will review the account shortly. \
             If you have a recent payment reference or receipt, please reply with it so we can \
             reconcile promptly."
        }
        TicketCategory::Leasing => {
            "We have received your message regarding the lease or renewal and will review it shortly. \
             We will update you once we have confirmed the next steps."
        }
        TicketCategory::Sales | TicketCategory::General => {
            "We have received your message and will respond shortly."
        }
    };
    let mut body = format!("Hello {first_name},\n\nThank you for your email. {middle}\n\nKind regards,");
    if ticket.priority == Priority::High {
        body = body.replace("will review", "will review as a priority");
    }
    (reply_subject(subject), body)
}

/// A new message listing tickets that still need attention.
#[derive(Debug, Clone)]
pub struct Digest<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub tickets: &'a [Ticket],
}

impl Digest<'_> {
    #[must_use]
    pub fn subject(&self) -> String {
        format!("Support Reminder Digest ({} open)", self.tickets.len())
    }

    /// One line per ticket: sender, subject, last activity and status.
    #[must_use]
    pub fn body(&self) -> String {
        let mut body = String::from("Tickets still waiting on a reply or unread:\n\n");
        for t in self.tickets {
            let sender = t
                .from_email
                .as_deref()
                .or(t.from_name.as_deref())
                .unwrap_or("(unknown sender)");
            let last = t
                .last_message_at
                .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d %H:%M UTC").to_string());
            let _ = writeln!(body, "- {sender} | {} | last: {last} | status: {}", t.subject, t.status);
        }
        body
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        if self.tickets.is_empty() {
            return Err(Error::InvalidInput("digest has no tickets".into()));
        }
        let from_address = address(self.from)?;
        let message_id = format!("<{}@{}>", Uuid::new_v4(), from_address.domain());
        let message = Message::builder()
            .message_id(Some(message_id))
            .from(Mailbox::new(None, from_address))
            .to(Mailbox::new(None, address(self.to)?))
            .subject(self.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(self.body())
            .map_err(|e| Error::InvalidInput(format!("cannot build digest: {e}")))?;
        Ok(message.formatted())
    }
}

impl Reply<'_> {
    /// Render the reply as raw message bytes.
    pub fn render(&self) -> Result<Vec<u8>> {
        if self.body.trim().is_empty() {
            return Err(Error::InvalidInput("reply body is empty".into()));
        }
        let from_address = address(self.from)?;
        let message_id = format!("<{}@{}>", Uuid::new_v4(), from_address.domain());
        let from = Mailbox::new(None, from_address);
        let to = Mailbox::new(self.to_name.map(String::from), address(self.to_email)?);

        let mut builder = Message::builder()
            .message_id(Some(message_id))
            .from(from)
            .to(to)
            .subject(reply_subject(self.subject))
            .header(ContentType::TEXT_PLAIN);
        if let Some(parent) = self.in_reply_to {
            builder = builder.in_reply_to(parent.to_string());
        }
        if !self.references.is_empty() {
            builder = builder.references(self.references.join(" "));
        }

        let message = builder
            .body(with_signature(self.body, self.signature))
            .map_err(|e| Error::InvalidInput(format!("cannot build reply: {e}")))?;
        Ok(message.formatted())
    }
}
