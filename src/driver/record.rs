//! Record - 쿼리 결과 레코드
//!
//! 결과 한 행. 필드 순서는 쿼리의 RETURN 컬럼 순서와 같습니다.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::error::{DriverError, DriverResult};
use super::types::Value;

// ============================================================================
// Record - 단일 레코드
// ============================================================================

/// 쿼리 결과 레코드
///
/// 같은 결과의 레코드들은 키 목록을 공유합니다.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// 컬럼 키 (공유)
    keys: Arc<[String]>,
    /// 값들
    values: Vec<Value>,
}

impl Record {
    /// 새 레코드 생성
    pub fn new(keys: impl Into<Arc<[String]>>, values: Vec<Value>) -> Self {
        Self {
            keys: keys.into(),
            values,
        }
    }

    /// 키 목록
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// 값 목록
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// 필드 수
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 빈 레코드 여부
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 키의 위치
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// 키로 값 가져오기
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.index_of(key).and_then(|i| self.values.get(i))
    }

    /// 인덱스로 값 가져오기
    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// 키로 타입 변환된 값 가져오기
    pub fn get_as<T>(&self, key: &str) -> DriverResult<T>
    where
        T: TryFrom<Value, Error = DriverError>,
    {
        self.get(key)
            .cloned()
            .ok_or_else(|| DriverError::type_conversion(format!("Key '{}' not found", key)))
            .and_then(T::try_from)
    }

    /// 인덱스로 타입 변환된 값 가져오기
    pub fn get_as_at<T>(&self, index: usize) -> DriverResult<T>
    where
        T: TryFrom<Value, Error = DriverError>,
    {
        self.values
            .get(index)
            .cloned()
            .ok_or_else(|| DriverError::type_conversion(format!("Index {} out of range", index)))
            .and_then(T::try_from)
    }

    /// Integer 값 가져오기
    pub fn get_int(&self, key: &str) -> DriverResult<i64> {
        self.get_as(key)
    }

    /// String 값 가져오기
    pub fn get_string(&self, key: &str) -> DriverResult<String> {
        self.get_as(key)
    }

    /// Boolean 값 가져오기
    pub fn get_bool(&self, key: &str) -> DriverResult<bool> {
        self.get_as(key)
    }

    /// Optional 값 가져오기 (Null 또는 없는 키는 None)
    pub fn get_optional<T>(&self, key: &str) -> DriverResult<Option<T>>
    where
        T: TryFrom<Value, Error = DriverError>,
    {
        match self.get(key) {
            Some(Value::Null) | None => Ok(None),
            Some(v) => T::try_from(v.clone()).map(Some),
        }
    }

    /// Map으로 변환
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.keys
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.keys.iter().zip(&self.values).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::iter::Zip<std::slice::Iter<'a, String>, std::slice::Iter<'a, Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter().zip(self.values.iter())
    }
}

// ============================================================================
// Tests
// ============================================================================
