// SMTP delivery for password set/reset tokens.
//
// Without SMTP configuration the mailer is a logging no-op, which keeps the
// enumeration-safe reset flow working in development.

use crate::config::Settings;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

#[derive(Clone)]
pub struct Mailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: Option<String>,
    frontend_base_url: Option<String>,
}

impl Mailer {
    pub fn from_settings(settings: &Settings) -> Self {
        let transport = match (&settings.smtp_host, &settings.smtp_from) {
            (Some(host), Some(_)) => {
                match AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                    .or_else(|_| AsyncSmtpTransport::<Tokio1Executor>::relay(host))
                {
                    Ok(builder) => {
                        let mut builder = builder.port(settings.smtp_port);
                        if let (Some(user), Some(pass)) =
                            (&settings.smtp_user, &settings.smtp_pass)
                        {
                            builder = builder
                                .credentials(Credentials::new(user.clone(), pass.clone()));
                        }
                        Some(builder.build())
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SMTP transport unavailable, mail disabled");
                        None
                    }
                }
            }
            _ => None,
        };

        Mailer {
            transport,
            from: settings.smtp_from.clone(),
            frontend_base_url: settings.frontend_base_url.clone(),
        }
    }

    /// Mailer that only logs; used in tests and SMTP-less deployments.
    pub fn disabled() -> Self {
        Mailer {
            transport: None,
            from: None,
            frontend_base_url: None,
        }
    }

    /// Sends a password token link. Failures are logged, never surfaced: the
    /// reset flow must not reveal whether delivery happened.
    pub async fn send_password_token(&self, email: &str, purpose: &str, token: &str) {
        let (Some(transport), Some(from)) = (&self.transport, &self.from) else {
            tracing::info!(email = %email, purpose = %purpose, "mail disabled, skipping delivery");
            return;
        };

        let link = match &self.frontend_base_url {
            Some(base) => format!("{base}/password/{purpose}?token={token}"),
            None => format!("token: {token}"),
        };

        let from_mailbox: Mailbox = match from.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => {
                tracing::warn!(error = %e, "invalid SMTP_FROM address");
                return;
            }
        };
        let to_mailbox: Mailbox = match email.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => {
                tracing::warn!(error = %e, email = %email, "invalid recipient address");
                return;
            }
        };

        let message = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject("CertHub password")
            .body(format!("Use the link below to continue:\n\n{link}\n"));

        match message {
            Ok(message) => {
                if let Err(e) = transport.send(message).await {
                    tracing::warn!(error = %e, email = %email, "password mail delivery failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, email = %email, "unable to build password mail"),
        }
    }
}
