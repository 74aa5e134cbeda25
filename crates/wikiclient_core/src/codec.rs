//! XML-RPC value model plus request encoding and response decoding.
//!
//! Encoding writes markup by hand; decoding goes through a `roxmltree` document so
//! that entity handling and attribute preservation follow a conforming XML parser.

use roxmltree::{Document, Node};
use serde_json::{Map, Number, Value};

use crate::error::{Result, WikiError};

/// Any value that can cross the XML-RPC wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Array(Vec<RpcValue>),
    /// Members in insertion order. Names are unique.
    Struct(Vec<(String, RpcValue)>),
}

/// A decoded `<methodResponse>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodResponse {
    /// `None` when `<params>` was present but empty (e.g. logoff).
    Success(Option<RpcValue>),
    Fault { code: i64, message: String },
}

impl RpcValue {
    /// Build a struct from `(name, value)` pairs. A repeated name replaces the earlier
    /// value in place.
    pub fn from_members<K, I>(members: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RpcValue)>,
    {
        let mut out: Vec<(String, RpcValue)> = Vec::new();
        for (name, value) in members {
            insert_member(&mut out, name.into(), value);
        }
        Self::Struct(out)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "int",
            Self::Boolean(_) => "boolean",
            Self::Array(_) => "array",
            Self::Struct(_) => "struct",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Integer view; numeric strings are accepted because the server is loose about
    /// `<int>` versus `<string>` for counters and timestamps.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RpcValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&RpcValue> {
        match self {
            Self::Struct(members) => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// First present member among `names`, rendered as text.
    pub fn text_field(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .find_map(|name| self.get(name))
            .map(RpcValue::to_text)
    }

    /// Flatten a value to display text. Arrays are concatenated; structs render as
    /// JSON.
    pub fn to_text(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Boolean(value) => (if *value { "1" } else { "0" }).to_string(),
            Self::Array(items) => items.iter().map(RpcValue::to_text).collect(),
            Self::Struct(_) => self.to_json().to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::String(value) => Value::String(value.clone()),
            Self::Integer(value) => Value::Number(Number::from(*value)),
            Self::Boolean(value) => Value::Bool(*value),
            Self::Array(items) => Value::Array(items.iter().map(RpcValue::to_json).collect()),
            Self::Struct(members) => {
                let mut map = Map::new();
                for (name, value) in members {
                    map.insert(name.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for RpcValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// Fractional numbers have no tag of their own here and travel as strings.
impl From<f64> for RpcValue {
    fn from(value: f64) -> Self {
        if value.fract() == 0.0 && value.abs() < 9.0e15 {
            Self::Integer(value as i64)
        } else {
            Self::String(value.to_string())
        }
    }
}

impl<T: Into<RpcValue>> From<Vec<T>> for RpcValue {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl TryFrom<Value> for RpcValue {
    type Error = WikiError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Err(WikiError::validation(
                "null has no XML-RPC representation",
            )),
            Value::Bool(flag) => Ok(Self::Boolean(flag)),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => Ok(Self::Integer(integer)),
                None => Ok(Self::String(number.to_string())),
            },
            Value::String(text) => Ok(Self::String(text)),
            Value::Array(items) => items
                .into_iter()
                .map(RpcValue::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Self::Array),
            Value::Object(map) => {
                let mut members = Vec::with_capacity(map.len());
                for (name, item) in map {
                    members.push((name, RpcValue::try_from(item)?));
                }
                Ok(Self::from_members(members))
            }
        }
    }
}

fn insert_member(members: &mut Vec<(String, RpcValue)>, name: String, value: RpcValue) {
    match members.iter_mut().find(|(existing, _)| *existing == name) {
        Some(slot) => slot.1 = value,
        None => members.push((name, value)),
    }
}

/// Escape `&`, `<` and `>`. The ampersand goes first so entities are not doubled.
pub fn escape_text(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Encode the typed body of a `<value>` element, e.g. `<int>3</int>`.
pub fn encode_value(value: &RpcValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &RpcValue) {
    match value {
        RpcValue::String(text) => {
            out.push_str("<string>");
            out.push_str(&escape_text(text));
            out.push_str("</string>");
        }
        RpcValue::Integer(number) => {
            out.push_str("<int>");
            out.push_str(&number.to_string());
            out.push_str("</int>");
        }
        RpcValue::Boolean(flag) => {
            out.push_str(if *flag {
                "<boolean>1</boolean>"
            } else {
                "<boolean>0</boolean>"
            });
        }
        RpcValue::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                out.push_str("<value>");
                write_value(out, item);
                out.push_str("</value>");
            }
            out.push_str("</data></array>");
        }
        RpcValue::Struct(members) => {
            out.push_str("<struct>");
            for (name, item) in members {
                out.push_str("<member><name>");
                out.push_str(&escape_text(name));
                out.push_str("</name><value>");
                write_value(out, item);
                out.push_str("</value></member>");
            }
            out.push_str("</struct>");
        }
    }
}

/// Render a complete `<methodCall>` document.
pub fn encode_call(method: &str, params: &[RpcValue]) -> Result<String> {
    if method.trim().is_empty() {
        return Err(WikiError::validation("XML-RPC method name cannot be empty"));
    }
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodCall>\n  <methodName>");
    out.push_str(&escape_text(method));
    out.push_str("</methodName>\n  <params>");
    for param in params {
        out.push_str("<param><value>");
        write_value(&mut out, param);
        out.push_str("</value></param>");
    }
    out.push_str("</params>\n</methodCall>");
    Ok(out)
}

/// Render a `<methodResponse>` document. Used by servers and test doubles.
pub fn encode_response(response: &MethodResponse) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodResponse>");
    match response {
        MethodResponse::Success(value) => {
            out.push_str("<params>");
            if let Some(value) = value {
                out.push_str("<param><value>");
                write_value(&mut out, value);
                out.push_str("</value></param>");
            }
            out.push_str("</params>");
        }
        MethodResponse::Fault { code, message } => {
            let fault = RpcValue::from_members([
                ("faultCode", RpcValue::Integer(*code)),
                ("faultString", RpcValue::String(message.clone())),
            ]);
            out.push_str("<fault><value>");
            write_value(&mut out, &fault);
            out.push_str("</value></fault>");
        }
    }
    out.push_str("</methodResponse>");
    out
}

pub fn has_xml_declaration(body: &str) -> bool {
    trim_leading(body).starts_with("<?xml")
}

/// Leading whitespace and byte-order marks, which servers sometimes emit before the
/// declaration.
fn trim_leading(body: &str) -> &str {
    body.trim_start_matches(|ch: char| ch.is_whitespace() || ch == '\u{feff}')
}

/// Decode a `<methodResponse>` document into a success payload or a fault.
pub fn decode_response(body: &str) -> Result<MethodResponse> {
    if !has_xml_declaration(body) {
        return Err(WikiError::malformed(
            "response does not start with an XML declaration",
        ));
    }
    let document = Document::parse(trim_leading(body))
        .map_err(|error| WikiError::malformed(format!("invalid XML: {error}")))?;
    let root = document.root_element();
    if root.tag_name().name() != "methodResponse" {
        return Err(WikiError::malformed(format!(
            "expected <methodResponse>, found <{}>",
            root.tag_name().name()
        )));
    }

    if let Some(fault) = child_element(root, "fault") {
        return decode_fault(fault);
    }

    let params = child_element(root, "params").ok_or_else(|| {
        WikiError::malformed("<methodResponse> carries neither <params> nor <fault>")
    })?;
    let Some(param) = child_element(params, "param") else {
        return Ok(MethodResponse::Success(None));
    };
    let value = child_element(param, "value")
        .ok_or_else(|| WikiError::malformed("<param> without <value>"))?;
    Ok(MethodResponse::Success(Some(decode_value(value)?)))
}

/// Decode a standalone `<value>…</value>` fragment.
pub fn decode_value_markup(markup: &str) -> Result<RpcValue> {
    let document = Document::parse(markup)
        .map_err(|error| WikiError::malformed(format!("invalid XML: {error}")))?;
    let root = document.root_element();
    if root.tag_name().name() != "value" {
        return Err(WikiError::malformed(format!(
            "expected <value>, found <{}>",
            root.tag_name().name()
        )));
    }
    decode_value(root)
}

fn decode_fault(fault: Node<'_, '_>) -> Result<MethodResponse> {
    let value = child_element(fault, "value")
        .ok_or_else(|| WikiError::malformed("<fault> without <value>"))?;
    let decoded = decode_value(value)?;
    if !matches!(decoded, RpcValue::Struct(_)) {
        return Err(WikiError::malformed(format!(
            "fault payload must be a struct, found {}",
            decoded.kind()
        )));
    }
    let code = decoded
        .get("faultCode")
        .and_then(RpcValue::as_i64)
        .unwrap_or(0);
    let message = decoded
        .get("faultString")
        .map(RpcValue::to_text)
        .unwrap_or_else(|| "Unknown error".to_string());
    Ok(MethodResponse::Fault { code, message })
}

fn decode_value(value: Node<'_, '_>) -> Result<RpcValue> {
    let Some(typed) = value.children().find(Node::is_element) else {
        // Untyped <value>text</value> defaults to string.
        return Ok(RpcValue::String(collect_text(value)));
    };

    match typed.tag_name().name() {
        "string" => Ok(RpcValue::String(collect_text(typed))),
        "int" | "i4" | "i8" => {
            let text = collect_text(typed);
            text.trim()
                .parse::<i64>()
                .map(RpcValue::Integer)
                .map_err(|_| WikiError::malformed(format!("invalid integer: {text:?}")))
        }
        "boolean" => match collect_text(typed).trim() {
            "1" | "true" => Ok(RpcValue::Boolean(true)),
            "0" | "false" => Ok(RpcValue::Boolean(false)),
            other => Err(WikiError::malformed(format!("invalid boolean: {other:?}"))),
        },
        "double" | "dateTime.iso8601" | "base64" => {
            Ok(RpcValue::String(collect_text(typed).trim().to_string()))
        }
        "array" => decode_array(typed),
        "struct" => decode_struct(typed),
        other => Err(WikiError::malformed(format!(
            "unsupported XML-RPC value type <{other}>"
        ))),
    }
}

fn decode_array(array: Node<'_, '_>) -> Result<RpcValue> {
    let Some(data) = child_element(array, "data") else {
        return Ok(RpcValue::Array(Vec::new()));
    };
    let mut items = Vec::new();
    for item in data.children().filter(Node::is_element) {
        if item.tag_name().name() != "value" {
            return Err(WikiError::malformed(format!(
                "unexpected <{}> inside <data>",
                item.tag_name().name()
            )));
        }
        items.push(decode_value(item)?);
    }
    Ok(RpcValue::Array(items))
}

fn decode_struct(structure: Node<'_, '_>) -> Result<RpcValue> {
    let mut members = Vec::new();
    for member in structure.children().filter(Node::is_element) {
        if member.tag_name().name() != "member" {
            return Err(WikiError::malformed(format!(
                "unexpected <{}> inside <struct>",
                member.tag_name().name()
            )));
        }
        let name = child_element(member, "name")
            .map(collect_text)
            .ok_or_else(|| WikiError::malformed("<member> without <name>"))?;
        let value = child_element(member, "value")
            .ok_or_else(|| WikiError::malformed(format!("<member> {name} without <value>")))?;
        insert_member(&mut members, name, decode_value(value)?);
    }
    Ok(RpcValue::Struct(members))
}

fn child_element<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == name)
}

fn collect_text(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(Node::is_text)
        .filter_map(|text| text.text())
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        MethodResponse, RpcValue, decode_response, decode_value_markup, encode_call,
        encode_response, encode_value, escape_text, has_xml_declaration,
    };
    use crate::error::WikiError;

    fn round_trip(value: &RpcValue) -> RpcValue {
        let markup = format!("<value>{}</value>", encode_value(value));
        decode_value_markup(&markup).expect("decode value")
    }

    fn success_body(inner: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?>\n<methodResponse><params><param><value>{inner}</value></param></params></methodResponse>"
        )
    }

    #[test]
    fn encodes_scalars() {
        assert_eq!(encode_value(&RpcValue::from("hi")), "<string>hi</string>");
        assert_eq!(encode_value(&RpcValue::from(42)), "<int>42</int>");
        assert_eq!(
            encode_value(&RpcValue::from(true)),
            "<boolean>1</boolean>"
        );
        assert_eq!(
            encode_value(&RpcValue::from(false)),
            "<boolean>0</boolean>"
        );
    }

    #[test]
    fn escapes_ampersand_before_angle_brackets() {
        assert_eq!(escape_text("a & <b>"), "a &amp; &lt;b&gt;");
        assert_eq!(escape_text("&lt;"), "&amp;lt;");
    }

    #[test]
    fn encodes_struct_members_in_insertion_order() {
        let value = RpcValue::from_members([
            ("sum", RpcValue::from("edit")),
            ("minor", RpcValue::from(false)),
        ]);
        assert_eq!(
            encode_value(&value),
            "<struct><member><name>sum</name><value><string>edit</string></value></member>\
             <member><name>minor</name><value><boolean>0</boolean></value></member></struct>"
        );
    }

    #[test]
    fn repeated_struct_names_replace_in_place() {
        let value = RpcValue::from_members([
            ("a", RpcValue::from(1)),
            ("b", RpcValue::from(2)),
            ("a", RpcValue::from(3)),
        ]);
        assert_eq!(
            value,
            RpcValue::Struct(vec![
                ("a".to_string(), RpcValue::Integer(3)),
                ("b".to_string(), RpcValue::Integer(2)),
            ])
        );
    }

    #[test]
    fn encodes_method_call_envelope() {
        let body = encode_call(
            "wiki.putPage",
            &[
                RpcValue::from("start"),
                RpcValue::from(vec![RpcValue::from(1), RpcValue::from("x")]),
            ],
        )
        .expect("encode");
        assert!(body.starts_with("<?xml version=\"1.0\"?>"));
        assert!(body.contains("<methodName>wiki.putPage</methodName>"));
        assert!(body.contains(
            "<param><value><array><data><value><int>1</int></value><value><string>x</string></value></data></array></value></param>"
        ));
    }

    #[test]
    fn empty_method_name_is_rejected() {
        let error = encode_call("  ", &[]).expect_err("must fail");
        assert!(matches!(error, WikiError::Validation(_)));
    }

    #[test]
    fn nested_values_round_trip() {
        let value = RpcValue::from_members([
            ("id", RpcValue::from("wiki:start")),
            ("size", RpcValue::from(120)),
            ("locked", RpcValue::from(false)),
            (
                "tags",
                RpcValue::from(vec![
                    RpcValue::from("a"),
                    RpcValue::from_members([("deep", RpcValue::from(true))]),
                ]),
            ),
        ]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn escaped_strings_parse_back_exactly() {
        let original = RpcValue::from("if a < b && c > d then <tag>");
        assert_eq!(round_trip(&original), original);
    }

    #[test]
    fn single_element_collections_keep_sequence_shape() {
        let one = success_body(
            "<array><data><value><struct><member><name>id</name><value><string>a</string></value></member></struct></value></data></array>",
        );
        let two = success_body(
            "<array><data><value><struct><member><name>id</name><value><string>a</string></value></member></struct></value>\
             <value><struct><member><name>id</name><value><string>b</string></value></member></struct></value></data></array>",
        );
        let MethodResponse::Success(Some(RpcValue::Array(one))) =
            decode_response(&one).expect("decode one")
        else {
            panic!("expected array");
        };
        let MethodResponse::Success(Some(RpcValue::Array(two))) =
            decode_response(&two).expect("decode two")
        else {
            panic!("expected array");
        };
        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 2);
        assert_eq!(one[0], two[0]);
        assert_eq!(
            one[0],
            RpcValue::Struct(vec![("id".to_string(), RpcValue::from("a"))])
        );
    }

    #[test]
    fn extracts_fault_code_and_message() {
        let body = "<?xml version=\"1.0\"?>\n<methodResponse><fault><value><struct>\
            <member><name>faultCode</name><value><int>4</int></value></member>\
            <member><name>faultString</name><value><string>Login failed</string></value></member>\
            </struct></value></fault></methodResponse>";
        assert_eq!(
            decode_response(body).expect("decode"),
            MethodResponse::Fault {
                code: 4,
                message: "Login failed".to_string(),
            }
        );
    }

    #[test]
    fn fault_code_may_be_a_string() {
        let body = "<?xml version=\"1.0\"?><methodResponse><fault><value><struct>\
            <member><name>faultCode</name><value><string>321</string></value></member>\
            <member><name>faultString</name><value>No such page</value></member>\
            </struct></value></fault></methodResponse>";
        assert_eq!(
            decode_response(body).expect("decode"),
            MethodResponse::Fault {
                code: 321,
                message: "No such page".to_string(),
            }
        );
    }

    #[test]
    fn empty_params_are_a_vacuous_success() {
        let body = "<?xml version=\"1.0\"?><methodResponse><params></params></methodResponse>";
        assert_eq!(
            decode_response(body).expect("decode"),
            MethodResponse::Success(None)
        );
    }

    #[test]
    fn missing_envelope_is_malformed() {
        let body = "<?xml version=\"1.0\"?><html><body>oops</body></html>";
        let error = decode_response(body).expect_err("must fail");
        assert!(matches!(error, WikiError::MalformedResponse(_)));

        let neither = "<?xml version=\"1.0\"?><methodResponse/>";
        assert!(matches!(
            decode_response(neither).expect_err("must fail"),
            WikiError::MalformedResponse(_)
        ));
    }

    #[test]
    fn non_xml_body_is_malformed() {
        let error = decode_response("<html>login</html>").expect_err("must fail");
        assert!(matches!(error, WikiError::MalformedResponse(_)));
    }

    #[test]
    fn untyped_and_textual_tags_decode_to_strings() {
        let body = success_body(
            "<struct><member><name>name</name><value>wiki:start</value></member>\
             <member><name>lastModified</name><value><dateTime.iso8601>20240101T10:00:00</dateTime.iso8601></value></member>\
             <member><name>ratio</name><value><double>0.5</double></value></member></struct>",
        );
        let MethodResponse::Success(Some(value)) = decode_response(&body).expect("decode") else {
            panic!("expected payload");
        };
        assert_eq!(value.get("name"), Some(&RpcValue::from("wiki:start")));
        assert_eq!(
            value.get("lastModified"),
            Some(&RpcValue::from("20240101T10:00:00"))
        );
        assert_eq!(value.get("ratio"), Some(&RpcValue::from("0.5")));
    }

    #[test]
    fn unknown_value_tag_is_rejected() {
        let body = success_body("<nil/>");
        let error = decode_response(&body).expect_err("must fail");
        assert!(error.to_string().contains("unsupported XML-RPC value type"));
    }

    #[test]
    fn encoded_responses_decode_back() {
        let response = MethodResponse::Success(Some(RpcValue::from(vec![RpcValue::from(
            "only",
        )])));
        assert_eq!(
            decode_response(&encode_response(&response)).expect("decode"),
            response
        );
        let fault = MethodResponse::Fault {
            code: 1,
            message: "a < b".to_string(),
        };
        assert_eq!(
            decode_response(&encode_response(&fault)).expect("decode"),
            fault
        );
    }

    #[test]
    fn json_values_convert_with_null_rejected() {
        let value = RpcValue::try_from(json!({"sum": "fix", "minor": true, "n": 2, "r": 1.5}))
            .expect("convert");
        assert_eq!(value.get("sum"), Some(&RpcValue::from("fix")));
        assert_eq!(value.get("minor"), Some(&RpcValue::from(true)));
        assert_eq!(value.get("n"), Some(&RpcValue::from(2)));
        assert_eq!(value.get("r"), Some(&RpcValue::from("1.5")));

        let error = RpcValue::try_from(json!({"missing": null})).expect_err("must fail");
        assert!(matches!(error, WikiError::Validation(_)));
    }

    #[test]
    fn byte_order_mark_before_declaration_is_accepted() {
        let body = format!("\u{feff}{}", success_body("<string>ok</string>"));
        assert!(has_xml_declaration(&body));
        assert!(has_xml_declaration(&format!("\u{feff}  \n{body}")));
        assert_eq!(
            decode_response(&body).expect("decode"),
            MethodResponse::Success(Some(RpcValue::from("ok")))
        );
    }

    #[test]
    fn text_views_flatten_values() {
        assert_eq!(RpcValue::from(vec!["a", "b"]).to_text(), "ab");
        assert_eq!(RpcValue::from(true).to_text(), "1");
        assert_eq!(RpcValue::from("17").as_i64(), Some(17));
        assert_eq!(RpcValue::from(true).as_i64(), None);
    }
}
