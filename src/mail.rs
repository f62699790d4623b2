use log::info;

pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Delivery seam. Implementations never error; `false` means the message was
/// not handed off.
pub trait EmailSender {
    fn send(&self, email: &OutgoingEmail) -> bool;
}

/// The daemon does not speak SMTP; actual delivery belongs to the host
/// process, which reads the attempts returned in responses. This sink only
/// decides whether an attempt counts as handed off, per the notify setting.
pub struct NotifySink {
    pub enabled: bool,
}

impl EmailSender for NotifySink {
    fn send(&self, email: &OutgoingEmail) -> bool {
        if !self.enabled {
            info!(
                "mail disabled; not sending '{}' ({} recipients)",
                email.subject,
                email.to.len()
            );
            return false;
        }
        info!(
            "mail handed off '{}' ({} recipients)",
            email.subject,
            email.to.len()
        );
        true
    }
}
