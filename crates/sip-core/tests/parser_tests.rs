// Integration tests for the datagram and streamed parser modes

use proptest::prelude::*;

use sipflow_sip_core::prelude::*;

const SCENARIO_A: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
    Via: SIP/2.0/UDP host.example.com;branch=z9hG4bK776asdhds\r\n\
    Max-Forwards: 70\r\n\
    To: Bob <sip:bob@example.com>\r\n\
    From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
    Call-ID: a84b4c76e66710\r\n\
    CSeq: 314159 INVITE\r\n\
    Content-Length: 0\r\n\r\n";

fn response(code: u16, call_id: &str, body: &str) -> String {
    format!(
        "SIP/2.0 {} OK\r\nVia: SIP/2.0/TCP 10.0.0.1:5060;branch=z9hG4bK{}\r\nCall-ID: {}\r\nCSeq: 1 OPTIONS\r\nContent-Length: {}\r\n\r\n{}",
        code,
        call_id,
        call_id,
        body.len(),
        body
    )
}

fn drain(parser: &mut Parser) -> Vec<Result<Message>> {
    std::iter::from_fn(|| parser.next_message()).collect()
}

#[test]
fn test_scenario_a_datagram_invite() {
    let mut parser = Parser::new(false);
    parser.write(SCENARIO_A.as_bytes()).unwrap();

    let results = drain(&mut parser);
    assert_eq!(results.len(), 1);

    let message = results[0].as_ref().unwrap();
    let request = message.as_request().expect("request");
    assert_eq!(request.method, Method::Invite);
    for name in ["To", "From", "Via", "CSeq", "Call-ID"] {
        assert_eq!(request.headers.get(name).len(), 1, "header {}", name);
    }
    assert_eq!(request.headers.cseq().map(|(seq, _)| seq), Some(314159));
    assert_eq!(request.headers.from().and_then(|f| f.tag()), Some("1928301774"));
    assert_eq!(message.via_hop().and_then(|v| v.branch()), Some("z9hG4bK776asdhds"));
    assert!(request.body.is_empty());
}

#[test]
fn test_scenario_c_streamed_split_second_message() {
    let first = response(200, "one", "");
    let second = response(202, "two", "hello");
    let (head, tail) = second.split_at(40);

    let mut parser = Parser::new(true);
    parser.write(format!("{}{}", first, head).as_bytes()).unwrap();

    let results = drain(&mut parser);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().call_id(), Some("one"));

    parser.write(tail.as_bytes()).unwrap();
    let results = drain(&mut parser);
    assert_eq!(results.len(), 1);
    let message = results[0].as_ref().unwrap();
    assert_eq!(message.call_id(), Some("two"));
    assert_eq!(&message.body()[..], b"hello");
}

#[test]
fn test_streamed_parser_usable_after_missing_content_length() {
    let mut parser = Parser::new(true);
    parser
        .write(b"OPTIONS sip:a@example.com SIP/2.0\r\nCall-ID: broken\r\n\r\n")
        .unwrap();
    parser.write(response(200, "ok", "body").as_bytes()).unwrap();

    let results = drain(&mut parser);
    assert_eq!(results.len(), 2);
    assert!(results[0].as_ref().unwrap_err().is_malformed());
    assert_eq!(results[1].as_ref().unwrap().call_id(), Some("ok"));
}

#[test]
fn test_compact_headers_round_trip() {
    let data = "SIP/2.0 200 OK\r\nv: SIP/2.0/UDP h.example.com:5070;branch=z9hG4bKa\r\n\
        i: compact@host\r\nf: <sip:a@example.com>;tag=x\r\nt: <sip:b@example.com>\r\nl: 0\r\n\r\n";
    let message = parse_message(data.as_bytes()).unwrap();
    assert_eq!(message.call_id(), Some("compact@host"));
    assert_eq!(message.via_hop().unwrap().port, Some(5070));

    let reparsed = parse_message(&message.to_bytes()).unwrap();
    assert_eq!(reparsed, message);
}

#[test]
fn test_header_order_groups_by_name() {
    let data = "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP a.example.com;branch=z9hG4bK1\r\n\
        Call-ID: x\r\nVia: SIP/2.0/UDP b.example.com;branch=z9hG4bK2\r\nContent-Length: 0\r\n\r\n";
    let message = parse_message(data.as_bytes()).unwrap();
    let text = message.to_string();
    let first_via = text.find("a.example.com").unwrap();
    let second_via = text.find("b.example.com").unwrap();
    let call_id = text.find("Call-ID").unwrap();
    assert!(first_via < second_via && second_via < call_id);
}

fn token() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,11}"
}

fn request_text() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("INVITE"), Just("OPTIONS"), Just("BYE"), Just("REGISTER"), Just("MESSAGE")],
        token(),
        token(),
        1u32..100_000,
        proptest::collection::vec(token(), 0..3),
        "([!-~][ -~]{0,63})?",
    )
        .prop_map(|(method, user, host, seq, extras, body)| {
            let mut text = format!(
                "{} sip:{}@{}.example.com SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {}.example.com:5060;branch=z9hG4bK{}\r\n\
                 From: <sip:{}@example.com>;tag={}\r\n\
                 To: <sip:{}@{}.example.com>\r\n\
                 Call-ID: {}@{}\r\n\
                 CSeq: {} {}\r\n",
                method, user, host, host, seq, user, seq, user, host, user, host, seq, method
            );
            for (i, value) in extras.iter().enumerate() {
                text.push_str(&format!("X-Extra-{}: {}\r\n", i, value));
            }
            text.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
            text
        })
}

proptest! {
    /// Serializing a parsed message and parsing it again gives the same message
    #[test]
    fn prop_round_trip(text in request_text()) {
        let parsed = parse_message(text.as_bytes()).unwrap();
        let reparsed = parse_message(&parsed.to_bytes()).unwrap();
        prop_assert_eq!(reparsed, parsed);
    }

    /// N datagrams give exactly N messages in order
    #[test]
    fn prop_datagram_framing(texts in proptest::collection::vec(request_text(), 1..6)) {
        let mut parser = Parser::new(false);
        for text in &texts {
            parser.write(text.as_bytes()).unwrap();
        }
        let results = drain(&mut parser);
        prop_assert_eq!(results.len(), texts.len());
        for (result, text) in results.into_iter().zip(&texts) {
            prop_assert_eq!(result.unwrap(), parse_message(text.as_bytes()).unwrap());
        }
    }

    /// Splitting a message at arbitrary points does not change the result
    #[test]
    fn prop_streamed_reassembly(
        text in request_text(),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let bytes = text.as_bytes();
        let mut points: Vec<usize> = cuts.iter().map(|idx| idx.index(bytes.len())).collect();
        points.push(0);
        points.push(bytes.len());
        points.sort_unstable();
        points.dedup();

        let mut parser = Parser::new(true);
        let mut emitted = Vec::new();
        for window in points.windows(2) {
            parser.write(&bytes[window[0]..window[1]]).unwrap();
            emitted.extend(drain(&mut parser));
        }

        prop_assert_eq!(emitted.len(), 1);
        let expected = parse_message(bytes).unwrap();
        prop_assert_eq!(emitted.remove(0).unwrap(), expected);
    }
}
