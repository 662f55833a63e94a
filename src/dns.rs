//! DNS message handling.
//!
//! This module decodes incoming queries and builds the two replies the
//! server synthesizes itself: the sinkhole answer and SERVFAIL. Wire
//! encoding is done by `hickory-proto`; forwarded replies never pass
//! through here.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};

use crate::errors::DnsError;
use crate::normalize::{normalize, NormalizedName};

/// Addresses and TTL handed out for blocked names.
#[derive(Debug, Clone, Copy)]
pub struct Sinkhole {
    pub v4: Ipv4Addr,
    pub v6: Ipv6Addr,
    pub ttl: u32,
}

impl Default for Sinkhole {
    fn default() -> Self {
        Self {
            v4: Ipv4Addr::UNSPECIFIED,
            v6: Ipv6Addr::UNSPECIFIED,
            ttl: crate::config::DEFAULT_BLOCK_TTL,
        }
    }
}

/// A decoded query, owned by the task handling it.
#[derive(Debug)]
pub struct ParsedQuery {
    /// The datagram exactly as received.
    pub raw: Vec<u8>,
    /// Decoded request.
    pub request: Message,
    pub id: u16,
    /// Normalized name of the first question.
    pub name: NormalizedName,
    pub query_type: RecordType,
    pub client: SocketAddr,
    pub received_at: Instant,
}

/// Decode a datagram into a query.
///
/// # Arguments
/// * `raw` - The datagram payload.
/// * `client` - Where it came from.
///
/// # Returns
/// The parsed query, or `MalformedDatagram` if it is not a decodable DNS
/// query with at least one question.
pub fn parse_query(raw: Vec<u8>, client: SocketAddr) -> Result<ParsedQuery, DnsError> {
    let received_at = Instant::now();
    let request =
        Message::from_vec(&raw).map_err(|e| DnsError::MalformedDatagram(e.to_string()))?;

    if request.message_type() != MessageType::Query {
        return Err(DnsError::MalformedDatagram("message is not a query".into()));
    }
    let question = request
        .queries()
        .first()
        .ok_or_else(|| DnsError::MalformedDatagram("no question".into()))?;

    let name = normalize(&question.name().to_ascii());
    let query_type = question.query_type();

    Ok(ParsedQuery {
        id: request.id(),
        name,
        query_type,
        client,
        received_at,
        request,
        raw,
    })
}

/// Response skeleton echoing the request's id, opcode, RD flag and questions.
fn reply_to(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.add_queries(request.queries().to_vec());
    response
}

/// Authoritative answer pointing the queried name at the sinkhole.
///
/// AAAA questions get the IPv6 sinkhole; every other type gets an A record.
pub fn sinkhole_response(request: &Message, sinkhole: &Sinkhole) -> Result<Vec<u8>, DnsError> {
    let mut response = reply_to(request);
    response.set_authoritative(true);
    response.set_response_code(ResponseCode::NoError);

    if let Some(question) = request.queries().first() {
        let rdata = match question.query_type() {
            RecordType::AAAA => RData::AAAA(AAAA(sinkhole.v6)),
            _ => RData::A(A(sinkhole.v4)),
        };
        response.add_answer(Record::from_rdata(question.name().clone(), sinkhole.ttl, rdata));
    }

    Ok(response.to_vec()?)
}

/// SERVFAIL carrying the original id and question, no answers.
pub fn servfail_response(request: &Message) -> Result<Vec<u8>, DnsError> {
    let mut response = reply_to(request);
    response.set_response_code(ResponseCode::ServFail);
    Ok(response.to_vec()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    pub(crate) fn query_bytes(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), record_type));
        message.to_vec().unwrap()
    }

    fn client() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    #[test]
    fn parses_id_name_and_type() {
        let query = parse_query(query_bytes(0x1234, "WWW.Ads.Example.com.", RecordType::AAAA), client())
            .unwrap();

        assert_eq!(query.id, 0x1234);
        assert_eq!(query.name.as_str(), "ads.example.com");
        assert_eq!(query.query_type, RecordType::AAAA);
        assert_eq!(query.client, client());
    }

    #[test]
    fn rejects_truncated_and_garbage_datagrams() {
        let full = query_bytes(7, "example.com.", RecordType::A);

        assert!(matches!(
            parse_query(full[..full.len() - 3].to_vec(), client()),
            Err(DnsError::MalformedDatagram(_))
        ));
        assert!(matches!(
            parse_query(vec![0xFF; 5], client()),
            Err(DnsError::MalformedDatagram(_))
        ));
        assert!(matches!(parse_query(Vec::new(), client()), Err(DnsError::MalformedDatagram(_))));
    }

    #[test]
    fn rejects_messages_without_questions_or_that_are_responses() {
        let mut empty = Message::new();
        empty.set_id(9);
        assert!(matches!(
            parse_query(empty.to_vec().unwrap(), client()),
            Err(DnsError::MalformedDatagram(_))
        ));

        let query = parse_query(query_bytes(9, "example.com.", RecordType::A), client()).unwrap();
        let reply = servfail_response(&query.request).unwrap();
        assert!(matches!(parse_query(reply, client()), Err(DnsError::MalformedDatagram(_))));
    }

    #[test]
    fn sinkhole_reply_answers_with_the_null_address() {
        let query = parse_query(query_bytes(0xBEEF, "a.ads.example.com.", RecordType::A), client())
            .unwrap();

        let bytes = sinkhole_response(&query.request, &Sinkhole::default()).unwrap();
        let reply = Message::from_vec(&bytes).unwrap();

        assert_eq!(reply.id(), 0xBEEF);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert!(reply.authoritative());
        assert!(reply.recursion_desired());
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.queries(), query.request.queries());
        assert_eq!(reply.answers().len(), 1);

        let answer = &reply.answers()[0];
        assert_eq!(answer.name(), query.request.queries()[0].name());
        assert_eq!(answer.ttl(), 60);
        assert_eq!(answer.data(), Some(&RData::A(A(Ipv4Addr::UNSPECIFIED))));
    }

    #[test]
    fn sinkhole_reply_uses_ipv6_for_aaaa() {
        let query =
            parse_query(query_bytes(1, "tracker.net.", RecordType::AAAA), client()).unwrap();
        let sinkhole = Sinkhole {
            v4: Ipv4Addr::new(10, 0, 0, 1),
            v6: Ipv6Addr::LOCALHOST,
            ttl: 30,
        };

        let reply = Message::from_vec(&sinkhole_response(&query.request, &sinkhole).unwrap()).unwrap();

        assert_eq!(reply.answers()[0].data(), Some(&RData::AAAA(AAAA(Ipv6Addr::LOCALHOST))));
        assert_eq!(reply.answers()[0].ttl(), 30);
    }

    #[test]
    fn servfail_reply_keeps_id_and_question() {
        let query = parse_query(query_bytes(0x4242, "example.com.", RecordType::MX), client())
            .unwrap();

        let reply = Message::from_vec(&servfail_response(&query.request).unwrap()).unwrap();

        assert_eq!(reply.id(), 0x4242);
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.queries(), query.request.queries());
        assert!(reply.answers().is_empty());
        assert!(!reply.authoritative());
    }
}
