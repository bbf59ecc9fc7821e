/// topic 以两字节长度前缀编码
const TOPIC_MAX_LENGTH: usize = u16::MAX as usize;

/// 发布消息使用的 topic 不能为空，也不可以包含通配符
pub fn valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= TOPIC_MAX_LENGTH
        && !topic.contains('+')
        && !topic.contains('#')
}

pub fn valid_subscribe_filter(filter: &str) -> bool {
    // 不可以订阅空 filter
    if filter.is_empty() || filter.len() > TOPIC_MAX_LENGTH {
        return false;
    }

    let filters = filter.split('/').collect::<Vec<&str>>();
    if let Some((last, remaining)) = filters.split_last() {
        for entry in remaining.iter() {
            // # 字符只能在最后一位
            if entry.contains('#') {
                return false;
            }
            // + 字符必须独占一层
            if entry.len() != 1 && entry.contains('+') {
                return false;
            }
        }

        // 最后一位的 # 和 + 字符必须跟在 '/' 后面
        if last.len() != 1 && (last.contains('#') || last.contains('+')) {
            return false;
        }
    }

    true
}
