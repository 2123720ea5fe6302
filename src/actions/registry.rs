//! 动作注册表
//!
//! 按名称存储 ActionMeta（是否门控 / 是否预览 / 前置条件标签 / 产物归类 / 语义类别），
//! 取代原来按动作名的巨型分支；测试可注册假动作。

use std::collections::HashMap;

use crate::core::precondition::Precondition;

/// 动作的语义类别，供计划步骤匹配打分使用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCategory {
    Create,
    Modify,
    Delete,
    Query,
    Save,
    Run,
    Generate,
}

impl ActionCategory {
    /// 类别关键词表：类别出现在步骤描述中即视为意图吻合
    /// 经验调参所得，非穷尽；参见 plan::STEP_MATCH_THRESHOLD 的说明
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            ActionCategory::Create => &["create", "new", "add", "make", "build"],
            ActionCategory::Modify => &["set", "change", "modify", "update", "adjust", "move", "rename"],
            ActionCategory::Delete => &["delete", "remove", "clear"],
            ActionCategory::Query => &["list", "get", "inspect", "check", "read"],
            ActionCategory::Save => &["save", "store", "export", "write"],
            ActionCategory::Run => &["run", "execute", "launch", "play", "test"],
            ActionCategory::Generate => &["generate", "draw", "sprite", "texture", "asset"],
        }
    }
}

/// 执行后产物记入 Artifacts 的哪个列表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// 新建的资源（场景 / 文件），按 path 或 name 参数记录
    CreatedResource,
    /// 被修改的资源
    ModifiedResource,
    /// 新增的实体（节点）
    AddedEntity,
    /// 执行过的命令，按动作名记录
    ExecutedCommand,
    /// 只读查询，不记录
    None,
}

/// 单个动作的元信息
#[derive(Debug, Clone)]
pub struct ActionMeta {
    pub name: String,
    /// 需要人工审批后才可执行
    pub gated: bool,
    /// 执行前可向宿主展示 diff 预览
    pub preview: bool,
    /// 执行前必须满足的环境前置条件
    pub precondition: Option<Precondition>,
    pub artifact: ArtifactKind,
    pub category: ActionCategory,
    /// 产物名取自哪个参数（如 "path" / "name"）
    pub artifact_param: Option<&'static str>,
}

impl ActionMeta {
    pub fn new(name: impl Into<String>, category: ActionCategory) -> Self {
        Self {
            name: name.into(),
            gated: false,
            preview: false,
            precondition: None,
            artifact: ArtifactKind::None,
            category,
            artifact_param: None,
        }
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn preview(mut self) -> Self {
        self.preview = true;
        self
    }

    pub fn requires(mut self, pre: Precondition) -> Self {
        self.precondition = Some(pre);
        self
    }

    pub fn artifact(mut self, kind: ArtifactKind, param: &'static str) -> Self {
        self.artifact = kind;
        self.artifact_param = Some(param);
        self
    }
}

/// 动作注册表：name -> ActionMeta
#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionMeta>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 场景编辑器的默认动作集（场景 / 节点 / 资源 / 脚本 / 运行）
    pub fn with_defaults() -> Self {
        use ActionCategory::*;
        use ArtifactKind::*;

        let mut reg = Self::new();
        reg.register(
            ActionMeta::new("create_scene", Create).artifact(CreatedResource, "path"),
        );
        reg.register(ActionMeta::new("open_scene", Query));
        reg.register(
            ActionMeta::new("save_scene", Save)
                .requires(Precondition::SceneOpen)
                .artifact(ModifiedResource, "path"),
        );
        reg.register(
            ActionMeta::new("add_node", Create)
                .requires(Precondition::SceneOpen)
                .artifact(AddedEntity, "name"),
        );
        reg.register(
            ActionMeta::new("remove_node", Delete)
                .gated()
                .requires(Precondition::SceneOpen),
        );
        reg.register(
            ActionMeta::new("rename_node", Modify).requires(Precondition::SceneOpen),
        );
        reg.register(
            ActionMeta::new("move_node", Modify).requires(Precondition::SceneOpen),
        );
        reg.register(
            ActionMeta::new("set_property", Modify)
                .preview()
                .requires(Precondition::SceneOpen),
        );
        reg.register(ActionMeta::new("get_scene_tree", Query).requires(Precondition::SceneOpen));
        reg.register(ActionMeta::new("list_scenes", Query));
        reg.register(
            ActionMeta::new("attach_script", Modify)
                .preview()
                .requires(Precondition::SceneOpen)
                .artifact(ModifiedResource, "script_path"),
        );
        reg.register(
            ActionMeta::new("write_file", Create)
                .gated()
                .preview()
                .artifact(CreatedResource, "path"),
        );
        reg.register(ActionMeta::new("read_file", Query));
        reg.register(
            ActionMeta::new("delete_file", Delete).gated(),
        );
        reg.register(
            ActionMeta::new("generate_sprite", Generate).artifact(CreatedResource, "output_path"),
        );
        reg.register(
            ActionMeta::new("run_game", Run)
                .gated()
                .artifact(ExecutedCommand, "scene"),
        );
        reg.register(ActionMeta::new("stop_game", Run));
        reg
    }

    pub fn register(&mut self, meta: ActionMeta) {
        self.actions.insert(meta.name.clone(), meta);
    }

    pub fn get(&self, name: &str) -> Option<&ActionMeta> {
        self.actions.get(name)
    }

    pub fn is_gated(&self, name: &str) -> bool {
        self.get(name).map(|m| m.gated).unwrap_or(false)
    }

    pub fn wants_preview(&self, name: &str) -> bool {
        self.get(name).map(|m| m.preview).unwrap_or(false)
    }

    pub fn precondition(&self, name: &str) -> Option<Precondition> {
        self.get(name).and_then(|m| m.precondition)
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }
}
