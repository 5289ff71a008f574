pub mod chats;
pub mod jobs;
pub mod users;
