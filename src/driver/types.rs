//! Driver Types
//!
//! 쿼리 파라미터와 결과 레코드에 쓰이는 그래프 값 타입

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::error::DriverError;

// ============================================================================
// Value - 그래프 값
// ============================================================================

/// 그래프 값 타입
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null
    Null,
    /// Boolean
    Boolean(bool),
    /// Integer (i64)
    Integer(i64),
    /// Float (f64)
    Float(f64),
    /// String
    String(String),
    /// Bytes
    Bytes(Vec<u8>),
    /// List
    List(Vec<Value>),
    /// Map
    Map(HashMap<String, Value>),
    /// Node
    Node(Node),
    /// Relationship
    Relationship(Relationship),
    /// Path
    Path(Path),
    /// Date
    Date(NaiveDate),
    /// LocalDateTime
    LocalDateTime(NaiveDateTime),
    /// DateTime (offset 포함)
    DateTime(DateTime<FixedOffset>),
}

impl Value {
    /// Null 여부
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Boolean으로 변환
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer로 변환
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Float로 변환 (Integer 허용)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String으로 변환
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// List로 변환
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Map으로 변환
    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Node로 변환
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(n) => Some(n),
            _ => None,
        }
    }

    /// 타입 이름
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Node(_) => "Node",
            Value::Relationship(_) => "Relationship",
            Value::Path(_) => "Path",
            Value::Date(_) => "Date",
            Value::LocalDateTime(_) => "LocalDateTime",
            Value::DateTime(_) => "DateTime",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => write!(f, "{{{} entries}}", m.len()),
            Value::Node(n) => write!(f, "{}", n),
            Value::Relationship(r) => write!(f, "{}", r),
            Value::Path(p) => write!(f, "<path: {} hops>", p.len()),
            Value::Date(d) => write!(f, "{}", d),
            Value::LocalDateTime(dt) => write!(f, "{}", dt),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

// From implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::LocalDateTime(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Value {
    fn from(v: HashMap<String, T>) -> Self {
        Value::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// ============================================================================
// Node / Relationship / Path - 그래프 엔티티
// ============================================================================

/// 그래프 노드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// 엘리먼트 ID
    pub element_id: String,
    /// 레이블
    pub labels: Vec<String>,
    /// 속성
    pub properties: HashMap<String, Value>,
}

impl Node {
    /// 새 노드 생성
    pub fn new(
        element_id: impl Into<String>,
        labels: Vec<String>,
        properties: HashMap<String, Value>,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            labels,
            properties,
        }
    }

    /// 레이블 포함 여부
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// 속성 가져오기
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.element_id)?;
        for label in &self.labels {
            write!(f, ":{}", label)?;
        }
        write!(f, ")")
    }
}

/// 그래프 관계
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// 엘리먼트 ID
    pub element_id: String,
    /// 시작 노드 엘리먼트 ID
    pub start_element_id: String,
    /// 끝 노드 엘리먼트 ID
    pub end_element_id: String,
    /// 타입
    #[serde(rename = "type")]
    pub rel_type: String,
    /// 속성
    pub properties: HashMap<String, Value>,
}

impl Relationship {
    /// 속성 가져오기
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({})-[:{}]->({})",
            self.start_element_id, self.rel_type, self.end_element_id
        )
    }
}

/// 그래프 경로
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    /// 노드들
    pub nodes: Vec<Node>,
    /// 관계들
    pub relationships: Vec<Relationship>,
}

impl Path {
    /// 경로 길이 (관계 수)
    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    /// 빈 경로 여부
    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }

    /// 시작 노드
    pub fn start(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// 끝 노드
    pub fn end(&self) -> Option<&Node> {
        self.nodes.last()
    }
}

// ============================================================================
// TryFrom implementations
// ============================================================================

macro_rules! impl_try_from_value {
    ($target:ty, $name:literal, $($pattern:pat => $out:expr),+ $(,)?) => {
        impl TryFrom<Value> for $target {
            type Error = DriverError;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    $($pattern => Ok($out),)+
                    other => Err(DriverError::type_conversion(format!(
                        "Cannot convert {} to {}",
                        other.type_name(),
                        $name
                    ))),
                }
            }
        }
    };
}

impl_try_from_value!(bool, "bool", Value::Boolean(b) => b);
impl_try_from_value!(i64, "i64", Value::Integer(i) => i);
impl_try_from_value!(f64, "f64", Value::Float(f) => f, Value::Integer(i) => i as f64);
impl_try_from_value!(String, "String", Value::String(s) => s);
impl_try_from_value!(Vec<Value>, "List", Value::List(l) => l);
impl_try_from_value!(Node, "Node", Value::Node(n) => n);
impl_try_from_value!(Relationship, "Relationship", Value::Relationship(r) => r);
impl_try_from_value!(Path, "Path", Value::Path(p) => p);
impl_try_from_value!(NaiveDate, "Date", Value::Date(d) => d);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Boolean(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_int(), Some(42));
        assert_eq!(Value::Integer(2).as_float(), Some(2.0));
        assert_eq!(Value::String("hello".into()).as_str(), Some("hello"));
        assert_eq!(Value::Integer(1).as_str(), None);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Integer(42).to_string(), "42");
        assert_eq!(Value::String("hello".into()).to_string(), "\"hello\"");
        assert_eq!(
            Value::from(vec![1i64, 2, 3]).to_string(),
            "[1, 2, 3]"
        );
    }

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from(true), Value::Boolean(true));
        assert_eq!(Value::from(7i32), Value::Integer(7));
        assert_eq!(Value::from("Alice"), Value::String("Alice".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".into()));

        let mut props = HashMap::new();
        props.insert("n".to_string(), 1i64);
        assert_eq!(Value::from(props).as_map().map(HashMap::len), Some(1));
    }

    #[test]
    fn test_value_try_from() {
        assert!(bool::try_from(Value::Boolean(true)).unwrap());
        assert_eq!(i64::try_from(Value::Integer(42)).unwrap(), 42);
        assert_eq!(f64::try_from(Value::Integer(3)).unwrap(), 3.0);
        assert_eq!(String::try_from(Value::String("a".into())).unwrap(), "a");

        let err = i64::try_from(Value::String("a".into())).unwrap_err();
        assert_eq!(err.to_string(), "Type conversion error: Cannot convert String to i64");
    }

    #[test]
    fn test_node() {
        let mut props = HashMap::new();
        props.insert("name".into(), Value::String("Alice".into()));

        let node = Node::new("4:abc:1", vec!["Person".into()], props);

        assert!(node.has_label("Person"));
        assert!(!node.has_label("Company"));
        assert_eq!(node.get("name"), Some(&Value::String("Alice".into())));
        assert_eq!(node.to_string(), "(4:abc:1:Person)");
    }

    #[test]
    fn test_path() {
        let alice = Node::new("1", vec!["Person".into()], HashMap::new());
        let bob = Node::new("2", vec!["Person".into()], HashMap::new());
        let knows = Relationship {
            element_id: "r1".into(),
            start_element_id: "1".into(),
            end_element_id: "2".into(),
            rel_type: "KNOWS".into(),
            properties: HashMap::new(),
        };

        let path = Path {
            nodes: vec![alice, bob],
            relationships: vec![knows],
        };

        assert_eq!(path.len(), 1);
        assert_eq!(path.start().map(|n| n.element_id.as_str()), Some("1"));
        assert_eq!(path.end().map(|n| n.element_id.as_str()), Some("2"));
        assert_eq!(path.relationships[0].to_string(), "(1)-[:KNOWS]->(2)");
    }

    #[test]
    fn test_temporal_values() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let value = Value::from(date);
        assert_eq!(value.type_name(), "Date");
        assert_eq!(value.to_string(), "2024-02-29");
        assert_eq!(NaiveDate::try_from(value).unwrap(), date);
    }
}
