/// 邮件模块 - 表单提交、模板渲染与发送调度
pub mod dispatcher;
pub mod error;
pub mod gmail;
pub mod message;
pub mod submission;
pub mod template;

pub use dispatcher::{DispatchMode, MailDispatcher};
