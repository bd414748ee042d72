//! Texts delivered to end users through the notifier.

use std::time::Duration;

pub const PROGRESS: &str = "正在思考中，这可能需要一些时间...";

pub const RESET_CONFIRMED: &str = "已重置对话，开始新的对话。";

pub const APOLOGY: &str = "抱歉，我遇到了技术问题，无法回答您的问题。";

pub const STALE_REQUEST: &str =
    "抱歉，您的请求处理时间超出了系统限制，已自动终止。请尝试简化您的问题。";

pub const TRUNCATION_NOTICE: &str = "\n\n[注意: 由于处理时间过长，回复已提前结束]";

pub const TIMEOUT_WITHOUT_ANSWER: &str = "处理超时，请尝试简化您的问题或稍后再试。";

pub const WELCOME_GUIDE: &str = "欢迎使用AI助手！以下是基本操作说明：

- 输入「重置」或「reset」: 清除历史对话记录，开始新对话
- 对话前面添加「思考:」: 启动推理模式，例如\"思考:9.9和9.11哪个大\"

有任何问题，随时向我提问！";

pub fn busy(elapsed: Duration) -> String {
    format!(
        "上一个请求正在处理中，已处理 {} 秒。如需取消，请输入'重置'",
        elapsed.as_secs()
    )
}
