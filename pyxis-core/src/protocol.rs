use smol_str::SmolStr;
use std::fmt;

/// 流协议标识符，例如 `/echo/1.0.0`。名称必须以 `/` 开头。
///
/// 静态名称在编译期构造，不分配内存；运行期协商得到的名称不超过
/// 23 字节时内联存储，更长时落在引用计数的堆上。两种情况下克隆
/// 都是 O(1)，协商循环里可以随意复制。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StreamProtocol(SmolStr);

impl StreamProtocol {
    /// 构造一个静态协议名。
    ///
    /// 名称不以 `/` 开头时在编译期（const 上下文）或首次调用时 panic。
    pub const fn new(name: &'static str) -> Self {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes[0] != b'/' {
            panic!("protocol names start with `/`");
        }
        StreamProtocol(SmolStr::new_static(name))
    }

    /// 从运行期字符串构造，多见于对端在协商中报出的名称。
    pub fn try_from_owned(name: String) -> Result<Self, InvalidProtocol> {
        if !name.starts_with('/') {
            return Err(InvalidProtocol { name });
        }
        Ok(StreamProtocol(SmolStr::from(name)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl AsRef<str> for StreamProtocol {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0.as_str(), f)
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl PartialEq<&str> for StreamProtocol {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_str() == *other
    }
}

impl PartialEq<StreamProtocol> for &str {
    fn eq(&self, other: &StreamProtocol) -> bool {
        *self == other.0.as_str()
    }
}

/// 被拒绝的协议名，保留原始输入便于上报。
#[derive(Debug, thiserror::Error)]
#[error("Invalid protocol name `{name}`, expected a leading `/`")]
pub struct InvalidProtocol {
    name: String,
}

impl InvalidProtocol {
    pub fn name(&self) -> &str {
        &self.name
    }
}
