//! S3 XML bodies: parsing service responses and building request payloads.
//!
//! Tags are matched on byte slices with `local_name()` so namespaced and
//! un-namespaced documents parse the same way.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;

use super::error::{Result, StorageError};
use super::types::{DeleteObjectError, DeleteObjectsOutput, ObjectMetadata};

/// Decoded `ListBucketResult` (ListObjectsV2)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ListObjectsResult {
    pub objects: Vec<ObjectMetadata>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

fn malformed(what: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::MalformedResponse(format!("{what}: {err}"))
}

/// Parse a ListObjectsV2 response body
pub(crate) fn parse_list_objects(xml: &[u8]) -> Result<ListObjectsResult> {
    let mut reader = Reader::from_reader(xml);

    let mut result = ListObjectsResult::default();
    let mut current: Option<ObjectMetadata> = None;
    let mut in_common_prefixes = false;
    let mut saw_root = false;
    let mut text = String::with_capacity(256);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                text.clear();
                match e.local_name().as_ref() {
                    b"ListBucketResult" => saw_root = true,
                    b"Contents" => current = Some(ObjectMetadata::new(String::new(), 0)),
                    b"CommonPrefixes" => in_common_prefixes = true,
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"ListBucketResult" {
                    saw_root = true;
                }
            }
            Ok(Event::Text(e)) => {
                let unescaped = e.unescape().map_err(|e| malformed("list response", e))?;
                text.push_str(&unescaped);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Key" => {
                        if let Some(obj) = current.as_mut() {
                            obj.key = std::mem::take(&mut text);
                        }
                    }
                    b"Size" => {
                        if let Some(obj) = current.as_mut() {
                            obj.size = text
                                .trim()
                                .parse()
                                .map_err(|e| malformed("object size", e))?;
                        }
                    }
                    b"LastModified" => {
                        if let Some(obj) = current.as_mut() {
                            obj.last_modified = Some(parse_timestamp(text.trim())?);
                        }
                    }
                    b"ETag" => {
                        if let Some(obj) = current.as_mut() {
                            obj.etag = Some(std::mem::take(&mut text));
                        }
                    }
                    b"StorageClass" => {
                        if let Some(obj) = current.as_mut() {
                            obj.storage_class = Some(std::mem::take(&mut text));
                        }
                    }
                    b"Contents" => {
                        if let Some(obj) = current.take() {
                            result.objects.push(obj);
                        }
                    }
                    b"Prefix" if in_common_prefixes => {
                        result.common_prefixes.push(std::mem::take(&mut text));
                    }
                    b"CommonPrefixes" => in_common_prefixes = false,
                    b"IsTruncated" => result.is_truncated = text.trim() == "true",
                    b"NextContinuationToken" => {
                        let token = std::mem::take(&mut text);
                        result.next_continuation_token = (!token.is_empty()).then_some(token);
                    }
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed("list response", e)),
            _ => {}
        }
    }

    if !saw_root {
        return Err(StorageError::MalformedResponse(
            "expected a ListBucketResult document".to_string(),
        ));
    }

    Ok(result)
}

/// Parse a DeleteObjects (`DeleteResult`) response body
pub(crate) fn parse_delete_result(xml: &[u8]) -> Result<DeleteObjectsOutput> {
    let mut reader = Reader::from_reader(xml);

    let mut output = DeleteObjectsOutput::default();
    let mut deleted: Option<String> = None;
    let mut error: Option<DeleteObjectError> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                text.clear();
                match e.local_name().as_ref() {
                    b"Deleted" => deleted = Some(String::new()),
                    b"Error" => {
                        error = Some(DeleteObjectError {
                            key: String::new(),
                            code: String::new(),
                            message: String::new(),
                        })
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                let unescaped = e.unescape().map_err(|e| malformed("delete response", e))?;
                text.push_str(&unescaped);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Key" => {
                        if let Some(key) = deleted.as_mut() {
                            *key = std::mem::take(&mut text);
                        } else if let Some(err) = error.as_mut() {
                            err.key = std::mem::take(&mut text);
                        }
                    }
                    b"Code" => {
                        if let Some(err) = error.as_mut() {
                            err.code = std::mem::take(&mut text);
                        }
                    }
                    b"Message" => {
                        if let Some(err) = error.as_mut() {
                            err.message = std::mem::take(&mut text);
                        }
                    }
                    b"Deleted" => output.deleted.extend(deleted.take()),
                    b"Error" => output.errors.extend(error.take()),
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed("delete response", e)),
            _ => {}
        }
    }

    Ok(output)
}

/// Extract `(Code, Message)` from an `<Error>` document.
///
/// Bodies that are empty or not XML yield `(None, None)`.
pub(crate) fn parse_error(xml: &[u8]) -> (Option<String>, Option<String>) {
    let mut reader = Reader::from_reader(xml);
    let (mut code, mut message) = (None, None);
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => text.clear(),
            Ok(Event::Text(e)) => match e.unescape() {
                Ok(t) => text.push_str(&t),
                Err(_) => break,
            },
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Code" => code = Some(std::mem::take(&mut text)),
                    b"Message" => message = Some(std::mem::take(&mut text)),
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    (code.filter(|c| !c.is_empty()), message)
}

/// Build the `<Delete>` request body for a bulk delete (verbose mode)
pub(crate) fn build_delete_request(keys: &[String]) -> String {
    let mut xml = String::with_capacity(keys.len() * 60 + 80);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Delete>");
    for key in keys {
        xml.push_str("<Object><Key>");
        escape_into(&mut xml, key);
        xml.push_str("</Key></Object>");
    }
    xml.push_str("</Delete>");
    xml
}

/// Decode a `<Delete>` request body: the keys and the `Quiet` flag
pub(crate) fn parse_delete_request(xml: &[u8]) -> Result<(Vec<String>, bool)> {
    let mut reader = Reader::from_reader(xml);
    let mut keys = Vec::new();
    let mut quiet = false;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => text.clear(),
            Ok(Event::Text(e)) => {
                let unescaped = e.unescape().map_err(|e| malformed("delete request", e))?;
                text.push_str(&unescaped);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Key" => keys.push(std::mem::take(&mut text)),
                    b"Quiet" => quiet = text.trim() == "true",
                    _ => {}
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed("delete request", e)),
            _ => {}
        }
    }

    Ok((keys, quiet))
}

/// Listing parameters echoed back in a `ListBucketResult`
#[derive(Debug, Clone, Default)]
pub(crate) struct ListEcho<'a> {
    pub bucket: &'a str,
    pub prefix: Option<&'a str>,
    pub delimiter: Option<&'a str>,
    pub max_keys: usize,
    pub continuation_token: Option<&'a str>,
}

/// Render a ListObjectsV2 response body
pub(crate) fn build_list_result(echo: &ListEcho<'_>, result: &ListObjectsResult) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">",
    );
    push_element(&mut xml, "Name", echo.bucket);
    push_element(&mut xml, "Prefix", echo.prefix.unwrap_or_default());
    if let Some(delimiter) = echo.delimiter {
        push_element(&mut xml, "Delimiter", delimiter);
    }
    push_element(&mut xml, "MaxKeys", &echo.max_keys.to_string());
    push_element(
        &mut xml,
        "KeyCount",
        &(result.objects.len() + result.common_prefixes.len()).to_string(),
    );
    push_element(&mut xml, "IsTruncated", &result.is_truncated.to_string());
    if let Some(token) = echo.continuation_token {
        push_element(&mut xml, "ContinuationToken", token);
    }
    if let Some(token) = result.next_continuation_token.as_deref() {
        push_element(&mut xml, "NextContinuationToken", token);
    }

    for obj in &result.objects {
        xml.push_str("<Contents>");
        push_element(&mut xml, "Key", &obj.key);
        if let Some(modified) = obj.last_modified {
            push_element(&mut xml, "LastModified", &format_timestamp(modified));
        }
        if let Some(etag) = obj.etag.as_deref() {
            push_element(&mut xml, "ETag", etag);
        }
        push_element(&mut xml, "Size", &obj.size.to_string());
        push_element(
            &mut xml,
            "StorageClass",
            obj.storage_class.as_deref().unwrap_or("STANDARD"),
        );
        xml.push_str("</Contents>");
    }
    for prefix in &result.common_prefixes {
        xml.push_str("<CommonPrefixes>");
        push_element(&mut xml, "Prefix", prefix);
        xml.push_str("</CommonPrefixes>");
    }

    xml.push_str("</ListBucketResult>");
    xml
}

/// Render a `DeleteResult` body
pub(crate) fn build_delete_result(output: &DeleteObjectsOutput) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <DeleteResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">",
    );
    for key in &output.deleted {
        xml.push_str("<Deleted>");
        push_element(&mut xml, "Key", key);
        xml.push_str("</Deleted>");
    }
    for err in &output.errors {
        xml.push_str("<Error>");
        push_element(&mut xml, "Key", &err.key);
        push_element(&mut xml, "Code", &err.code);
        push_element(&mut xml, "Message", &err.message);
        xml.push_str("</Error>");
    }
    xml.push_str("</DeleteResult>");
    xml
}

/// `CreateBucketConfiguration` body pinning the bucket to `region`
pub(crate) fn build_create_bucket(region: &str) -> String {
    let mut xml = String::from(
        "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">",
    );
    push_element(&mut xml, "LocationConstraint", region);
    xml.push_str("</CreateBucketConfiguration>");
    xml
}

/// Render an `<Error>` body
pub(crate) fn build_error(code: &str, message: &str, resource: &str) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error>");
    push_element(&mut xml, "Code", code);
    push_element(&mut xml, "Message", message);
    push_element(&mut xml, "Resource", resource);
    xml.push_str("</Error>");
    xml
}

pub(crate) fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed("LastModified", e))
}

fn push_element(xml: &mut String, name: &str, value: &str) {
    let _ = write!(xml, "<{name}>");
    escape_into(xml, value);
    let _ = write!(xml, "</{name}>");
}

/// Escape XML special characters into an existing buffer
fn escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}
