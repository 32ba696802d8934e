//! Email service for password resets and permit notifications.
//!
//! Bodies are minijinja templates rendered to HTML. In development the file transport writes each
//! message to the configured directory instead of sending it.

use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use minijinja::{Environment, context};
use std::path::Path;
use tracing::{debug, instrument, warn};

use crate::{
    config::{Config, EmailTransportConfig},
    db::models::{applications::ApplicationDBResponse, users::UserDBResponse},
    errors::Error,
    types::abbrev_uuid,
};

const PASSWORD_RESET_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Restablecer contraseña</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <h2>Restablecer contraseña</h2>
  <p>Hola {{ name }},</p>
  <p>Recibimos una solicitud para restablecer tu contraseña. Si no la hiciste, puedes ignorar este correo.</p>
  <p><a href="{{ reset_link }}">Restablecer contraseña</a></p>
  <p>{{ reset_link }}</p>
  <p>El enlace vence en {{ expires_minutes }} minutos.</p>
</body>
</html>"#;

const PERMIT_READY_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Tu permiso está listo</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <h2>Tu permiso de circulación está listo</h2>
  <p>Hola {{ name }},</p>
  <p>El permiso con folio <strong>{{ folio }}</strong> para tu {{ make }} {{ model }} ({{ vin }}) ya está disponible.</p>
  {% if valid_until %}<p>Vigencia hasta el {{ valid_until }}.</p>{% endif %}
  <p><a href="{{ application_link }}">Descargar permiso</a></p>
</body>
</html>"#;

pub struct EmailService {
    transport: EmailTransport,
    from_email: String,
    from_name: String,
    reply_to: Option<String>,
    base_url: String,
    reset_token_minutes: u64,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

impl EmailService {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let email_config = &config.email;

        let transport = match &email_config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let emails_dir = Path::new(path);
                if !emails_dir.exists() {
                    std::fs::create_dir_all(emails_dir).map_err(|e| Error::Internal {
                        operation: format!("create emails directory: {e}"),
                    })?;
                }
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
        };

        Ok(Self {
            transport,
            from_email: email_config.from_email.clone(),
            from_name: email_config.from_name.clone(),
            reply_to: email_config.reply_to.clone(),
            base_url: config.dashboard_url.trim_end_matches('/').to_string(),
            reset_token_minutes: config.auth.native.password_reset_token_duration.as_secs() / 60,
        })
    }

    #[instrument(skip_all, fields(user_id = %abbrev_uuid(&user.id)), err)]
    pub async fn send_password_reset_email(&self, user: &UserDBResponse, token_id: &uuid::Uuid, token: &str) -> Result<(), Error> {
        let body = self.password_reset_body(user, token_id, token)?;
        self.send_email(&user.email, Some(&user.full_name()), "Restablecer contraseña", &body)
            .await
    }

    #[instrument(skip_all, fields(application_id = %abbrev_uuid(&application.id)), err)]
    pub async fn send_permit_ready_email(&self, user: &UserDBResponse, application: &ApplicationDBResponse) -> Result<(), Error> {
        let body = self.permit_ready_body(user, application)?;
        self.send_email(&user.email, Some(&user.full_name()), "Tu permiso de circulación está listo", &body)
            .await
    }

    fn password_reset_body(&self, user: &UserDBResponse, token_id: &uuid::Uuid, token: &str) -> Result<String, Error> {
        let reset_link = format!("{}/reset-password?id={}&token={}", self.base_url, token_id, token);
        render(
            PASSWORD_RESET_TEMPLATE,
            context! {
                name => user.first_name,
                reset_link => reset_link,
                expires_minutes => self.reset_token_minutes,
            },
        )
    }

    fn permit_ready_body(&self, user: &UserDBResponse, application: &ApplicationDBResponse) -> Result<String, Error> {
        render(
            PERMIT_READY_TEMPLATE,
            context! {
                name => user.first_name,
                folio => application.folio,
                make => application.make,
                model => application.model,
                vin => application.vin,
                valid_until => application.valid_until.map(|d| d.format("%d/%m/%Y").to_string()),
                application_link => format!("{}/applications/{}", self.base_url, application.id),
            },
        )
    }

    async fn send_email(&self, to_email: &str, to_name: Option<&str>, subject: &str, body: &str) -> Result<(), Error> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| Error::Internal {
                operation: format!("parse from email: {e}"),
            })?;

        let to = match to_name {
            Some(name) => format!("{name} <{to_email}>"),
            None => to_email.to_string(),
        }
        .parse::<Mailbox>()
        .map_err(|e| Error::Internal {
            operation: format!("parse to email: {e}"),
        })?;

        let mut builder = Message::builder().from(from).to(to).subject(subject).header(ContentType::TEXT_HTML);
        if let Some(reply_to) = &self.reply_to {
            let reply_to = reply_to.parse::<Mailbox>().map_err(|e| Error::Internal {
                operation: format!("parse reply-to email: {e}"),
            })?;
            builder = builder.reply_to(reply_to);
        }
        let message = builder.body(body.to_string()).map_err(|e| Error::Internal {
            operation: format!("build email message: {e}"),
        })?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send SMTP email: {e}"),
                })?;
            }
            EmailTransport::File(file) => {
                file.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send file email: {e}"),
                })?;
            }
        }

        debug!(subject, "Email sent");
        Ok(())
    }
}

fn render(template: &str, ctx: minijinja::Value) -> Result<String, Error> {
    Environment::new().render_str(template, ctx).map_err(|e| Error::Internal {
        operation: format!("render email template: {e}"),
    })
}
