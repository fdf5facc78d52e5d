use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("message could not be parsed")]
    Unparseable,
}

#[derive(Debug, Clone, Serialize)]
pub struct MailAttachment {
    pub filename: Option<String>,
    pub content_type: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

/// The logical pieces of an RFC 5322 message, after transfer-encoding
/// decoding: the first `text/plain` and first `text/html` leaves in
/// depth-first order become the bodies, every other leaf an attachment.
#[derive(Debug, Default, Serialize)]
pub struct ParsedMail {
    pub subject: Option<String>,
    pub headers: serde_json::Map<String, serde_json::Value>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<MailAttachment>,
}

pub fn parse(raw: &[u8]) -> Result<ParsedMail, MimeError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(MimeError::Unparseable)?;

    let mut headers = serde_json::Map::new();
    for header in &message.root_part().headers {
        let value = serde_json::to_value(header.value()).unwrap_or(serde_json::Value::Null);
        headers.insert(header.name().to_string(), value);
    }

    let mut parsed = ParsedMail {
        subject: message.subject().map(str::to_string),
        headers,
        ..Default::default()
    };

    collect_part(&message, 0, &mut parsed);

    Ok(parsed)
}

fn collect_part(message: &Message<'_>, part_id: usize, out: &mut ParsedMail) {
    let Some(part) = message.parts.get(part_id) else {
        return;
    };

    match &part.body {
        PartType::Multipart(children) => {
            for &child in children {
                collect_part(message, child as usize, out);
            }
        }
        PartType::Text(text) if out.text_body.is_none() => {
            out.text_body = Some(text.to_string());
        }
        PartType::Html(html) if out.html_body.is_none() => {
            out.html_body = Some(html.to_string());
        }
        // every other leaf, including second text/html parts and embedded
        // message/rfc822, is carried as an attachment
        _ => out.attachments.push(attachment_from(message, part_id)),
    }
}

fn attachment_from(message: &Message<'_>, part_id: usize) -> MailAttachment {
    let part = &message.parts[part_id];

    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(subtype) => format!("{}/{subtype}", ct.ctype()),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| match &part.body {
            PartType::Text(_) => "text/plain".to_string(),
            PartType::Html(_) => "text/html".to_string(),
            PartType::Message(_) => "message/rfc822".to_string(),
            _ => "application/octet-stream".to_string(),
        });

    let content_id = part
        .content_id()
        .map(|id| id.trim_matches(['<', '>']).to_string());

    let is_inline = match part.content_disposition() {
        Some(disposition) => disposition.ctype().eq_ignore_ascii_case("inline"),
        None => matches!(part.body, PartType::InlineBinary(_)),
    };

    MailAttachment {
        filename: part.attachment_name().map(str::to_string),
        content_type,
        content: part.contents().to_vec(),
        content_id,
        is_inline,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_text_without_content_type() {
        let raw = b"Subject: Hi\r\nFrom: a@example.com\r\n\r\nhello world\r\n";

        let mail = parse(raw).unwrap();

        assert_eq!(mail.subject.as_deref(), Some("Hi"));
        assert!(mail.text_body.as_deref().unwrap().starts_with("hello world"));
        assert!(mail.html_body.is_none());
        assert!(mail.attachments.is_empty());
        assert!(mail.headers.contains_key("Subject"));
    }

    #[test]
    fn multipart_mixed_roundtrip() {
        let raw = concat!(
            "Subject: Report\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "plain part\r\n",
            "--outer\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>html part</p>\r\n",
            "--outer\r\n",
            "Content-Type: application/pdf; name=\"report.pdf\"\r\n",
            "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0xLjQ=\r\n",
            "--outer--\r\n",
        );

        let mail = parse(raw.as_bytes()).unwrap();

        assert_eq!(mail.text_body.as_deref(), Some("plain part"));
        assert_eq!(mail.html_body.as_deref(), Some("<p>html part</p>"));
        assert_eq!(mail.attachments.len(), 1);

        let attachment = &mail.attachments[0];
        assert_eq!(attachment.filename.as_deref(), Some("report.pdf"));
        assert_eq!(attachment.content_type, "application/pdf");
        assert_eq!(attachment.content, b"%PDF-1.4");
        assert!(!attachment.is_inline);
    }

    #[test]
    fn quoted_printable_is_decoded() {
        let raw = concat!(
            "Subject: QP\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "na=C3=AFve text\r\n",
        );

        let mail = parse(raw.as_bytes()).unwrap();

        assert!(mail.text_body.as_deref().unwrap().starts_with("naïve text"));
    }

    #[test]
    fn nested_multipart_alternative() {
        let raw = concat!(
            "Subject: Nested\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "alt text\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<b>alt html</b>\r\n",
            "--inner--\r\n",
            "--outer\r\n",
            "Content-Type: image/png\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "Content-ID: <logo@example>\r\n",
            "Content-Disposition: inline\r\n",
            "\r\n",
            "iVBORw0KGgo=\r\n",
            "--outer--\r\n",
        );

        let mail = parse(raw.as_bytes()).unwrap();

        assert_eq!(mail.text_body.as_deref(), Some("alt text"));
        assert_eq!(mail.html_body.as_deref(), Some("<b>alt html</b>"));
        assert_eq!(mail.attachments.len(), 1);

        let inline = &mail.attachments[0];
        assert_eq!(inline.content_id.as_deref(), Some("logo@example"));
        assert!(inline.is_inline);
        assert_eq!(inline.content_type, "image/png");
    }

    #[test]
    fn second_text_part_becomes_attachment() {
        let raw = concat!(
            "Subject: Two texts\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "first\r\n",
            "--b\r\n",
            "Content-Type: text/plain; name=\"notes.txt\"\r\n",
            "\r\n",
            "second\r\n",
            "--b--\r\n",
        );

        let mail = parse(raw.as_bytes()).unwrap();

        assert_eq!(mail.text_body.as_deref(), Some("first"));
        assert_eq!(mail.attachments.len(), 1);
        assert_eq!(mail.attachments[0].filename.as_deref(), Some("notes.txt"));
    }

    #[test]
    fn filename_falls_back_to_content_type_name() {
        let raw = concat!(
            "Subject: Fallback\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "body\r\n",
            "--b\r\n",
            "Content-Type: application/zip; name=\"bundle.zip\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "UEsDBA==\r\n",
            "--b--\r\n",
        );

        let mail = parse(raw.as_bytes()).unwrap();

        assert_eq!(mail.attachments[0].filename.as_deref(), Some("bundle.zip"));
    }
}
