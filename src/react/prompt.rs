//! 系统提示词组装：有序的纯变换 `PromptTree -> PromptTree`
//!
//! 调用方显式构造管道并按顺序应用，渲染时各段以空行连接。

/// 提示词的一个命名段落
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSection {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptTree {
    pub sections: Vec<PromptSection>,
}

impl PromptTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_section(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.upsert(name, body);
        self
    }

    /// 同名段落替换正文，否则追加到末尾
    pub fn upsert(&mut self, name: impl Into<String>, body: impl Into<String>) {
        let name = name.into();
        let body = body.into();
        match self.sections.iter_mut().find(|s| s.name == name) {
            Some(s) => s.body = body,
            None => self.sections.push(PromptSection { name, body }),
        }
    }

    pub fn section(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.body.as_str())
    }

    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.body.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub type PromptTransform = Box<dyn Fn(PromptTree) -> PromptTree + Send + Sync>;

#[derive(Default)]
pub struct PromptPipeline {
    transforms: Vec<PromptTransform>,
}

impl PromptPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<F>(mut self, f: F) -> Self
    where
        F: Fn(PromptTree) -> PromptTree + Send + Sync + 'static,
    {
        self.transforms.push(Box::new(f));
        self
    }

    /// 追加（或替换）一个固定段落
    pub fn section(self, name: impl Into<String>, body: impl Into<String>) -> Self {
        let name = name.into();
        let body = body.into();
        self.then(move |tree| tree.with_section(name.clone(), body.clone()))
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn apply(&self, tree: PromptTree) -> PromptTree {
        self.transforms.iter().fold(tree, |acc, f| f(acc))
    }

    pub fn render(&self, tree: PromptTree) -> String {
        self.apply(tree).render()
    }
}
