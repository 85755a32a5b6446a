//! Email notifications for servercheck.
//!
//! Every email has the same shape: a short HTML message (warning, alarm or
//! status), an optional override note, one line per metric comparing its
//! current value with its limit, and the three trend charts embedded
//! inline by content id. A chart file that does not exist is replaced by a
//! "Could not find image file" note.
//!
//! Delivery goes through the [`Mailer`] trait. [`SmtpMailer`] submits over
//! SMTP with STARTTLS and login. Failures are logged and reported as
//! [`Delivery::Failed`]; nothing is retried and the run carries on.

use std::path::{Path, PathBuf};

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;
use tracing::{error, info};

use crate::charts::{ChartRenderer, CHART_FILES};
use crate::config::MailSettings;
use crate::history::HistoryWindow;
use crate::metrics::Sample;
use crate::thresholds::Limits;

/// Subject and message used when a caller passes an empty subject.
pub const DEFAULT_SUBJECT: &str = "Server status report";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid address {address}: {source}")]
    Address {
        address: String,
        source: lettre::address::AddressError,
    },
    #[error("invalid mail server: {0}")]
    Server(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("smtp delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Outcome of one send attempt.
#[derive(Debug)]
pub enum Delivery {
    Sent,
    Failed(DeliveryError),
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// A PNG referenced from the HTML body as `cid:<content_id>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineImage {
    pub content_id: String,
    pub data: Vec<u8>,
}

/// A composed email, independent of the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub html: String,
    pub images: Vec<InlineImage>,
}

/// Sends composed emails.
pub trait Mailer {
    fn send(&self, email: &Email) -> Result<(), DeliveryError>;
}

/// Authenticated mail submission with STARTTLS.
pub struct SmtpMailer {
    settings: MailSettings,
}

impl SmtpMailer {
    pub fn new(settings: MailSettings) -> Self {
        Self { settings }
    }

    fn mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
        address.parse().map_err(|source| DeliveryError::Address {
            address: address.to_string(),
            source,
        })
    }

    fn build_message(&self, email: &Email) -> Result<Message, DeliveryError> {
        let png = ContentType::parse("image/png")
            .map_err(|err| DeliveryError::Build(err.to_string()))?;

        let mut body = MultiPart::related().singlepart(SinglePart::html(email.html.clone()));
        for image in &email.images {
            body = body.singlepart(
                Attachment::new_inline(image.content_id.clone()).body(image.data.clone(), png.clone()),
            );
        }

        Message::builder()
            .from(Self::mailbox(&self.settings.sender)?)
            .to(Self::mailbox(&self.settings.receiver)?)
            .subject(email.subject.clone())
            .multipart(body)
            .map_err(|err| DeliveryError::Build(err.to_string()))
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, email: &Email) -> Result<(), DeliveryError> {
        let message = self.build_message(email)?;
        let (host, port) = self
            .settings
            .server_address()
            .map_err(|err| DeliveryError::Server(err.to_string()))?;

        let transport = SmtpTransport::starttls_relay(&host)?
            .port(port)
            .credentials(Credentials::new(
                self.settings.sender.clone(),
                self.settings.app_password.clone(),
            ))
            .build();
        transport.send(&message)?;
        Ok(())
    }
}

/// Per-metric `value (limit)` lines.
pub fn status_lines(sample: &Sample, limits: &Limits) -> String {
    let mut lines = String::new();
    for (package, temp) in &sample.tempinfo {
        lines.push_str(&format!(
            "Package {package} temperature: {temp}ºC (limit: {}ºC) <br>",
            limits.max_temp
        ));
    }
    for (partition, usage) in &sample.diskinfo {
        let usage = usage.map_or_else(|| "n/a".to_string(), |u| format!("{u}%"));
        lines.push_str(&format!(
            "Partition '{partition}' usage: {usage} (limit: {}%) <br>",
            limits.max_disk
        ));
    }
    lines.push_str(&format!(
        "Memory usage: {}% (limit: {}%) <br>",
        sample.meminfo as i64, limits.max_mem
    ));
    lines.push_str(&format!(
        "CPU usage: {}% (limit: {}%) <br>",
        sample.cpuinfo as i64, limits.max_cpu
    ));
    lines
}

/// Build the email body and attach whichever charts exist in `chart_dir`.
pub fn compose(
    subject: &str,
    message: &str,
    override_note: &str,
    sample: &Sample,
    limits: &Limits,
    chart_dir: &Path,
) -> Email {
    let (subject, message) = if subject.is_empty() {
        (DEFAULT_SUBJECT, DEFAULT_SUBJECT)
    } else {
        (subject, message)
    };

    let mut html = format!(
        "{message}{override_note}<br>{}",
        status_lines(sample, limits)
    );
    let mut images = Vec::new();

    for file_name in CHART_FILES {
        match std::fs::read(chart_dir.join(file_name)) {
            Ok(data) => {
                html.push_str(&format!("<br><img src=\"cid:{file_name}\">"));
                images.push(InlineImage {
                    content_id: file_name.to_string(),
                    data,
                });
            }
            Err(_) => html.push_str(&format!("Could not find image file {file_name}<br>")),
        }
    }

    Email {
        subject: subject.to_string(),
        html: format!("<html><body>{html}</body></html>"),
        images,
    }
}

/// Renders charts, composes and sends emails for one run.
pub struct Notifier<'a> {
    mailer: &'a dyn Mailer,
    charts: Option<&'a ChartRenderer>,
    chart_dir: PathBuf,
    override_note: &'a str,
    limits: Limits,
}

impl<'a> Notifier<'a> {
    pub fn new(
        mailer: &'a dyn Mailer,
        charts: Option<&'a ChartRenderer>,
        chart_dir: impl Into<PathBuf>,
        override_note: &'a str,
        limits: Limits,
    ) -> Self {
        Self {
            mailer,
            charts,
            chart_dir: chart_dir.into(),
            override_note,
            limits,
        }
    }

    /// Refresh the charts, then compose and send one email.
    ///
    /// Never fails: a delivery error is logged and returned as
    /// [`Delivery::Failed`].
    pub fn send(
        &self,
        subject: &str,
        message: &str,
        window: &HistoryWindow,
        sample: &Sample,
    ) -> Delivery {
        if let Some(charts) = self.charts {
            charts.render_all(window, self.limits.max_temp);
        }

        let email = compose(
            subject,
            message,
            self.override_note,
            sample,
            &self.limits,
            &self.chart_dir,
        );

        match self.mailer.send(&email) {
            Ok(()) => {
                info!(subject = %email.subject, images = email.images.len(), "email sent");
                Delivery::Sent
            }
            Err(err) => {
                error!(subject = %email.subject, error = %err, "something went wrong sending email");
                Delivery::Failed(err)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use super::{DeliveryError, Email, Mailer};

    /// Records emails instead of sending them; optionally fails every send.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub(crate) sent: RefCell<Vec<Email>>,
        pub(crate) fail: bool,
    }

    impl RecordingMailer {
        pub(crate) fn failing() -> Self {
            Self {
                sent: RefCell::default(),
                fail: true,
            }
        }

        pub(crate) fn subjects(&self) -> Vec<String> {
            self.sent.borrow().iter().map(|e| e.subject.clone()).collect()
        }
    }

    impl Mailer for RecordingMailer {
        fn send(&self, email: &Email) -> Result<(), DeliveryError> {
            self.sent.borrow_mut().push(email.clone());
            if self.fail {
                Err(DeliveryError::Server("refused by test mailer".to_string()))
            } else {
                Ok(())
            }
        }
    }
}
