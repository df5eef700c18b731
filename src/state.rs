use std::sync::Arc;

use crate::config::AppMode;
use crate::db::TaskRepository;
use crate::services::schedule_manager::ScheduleManager;
use crate::services::status_gateway::RealtimeStatusGateway;
use crate::services::task_submission::TaskSubmissionService;

#[derive(Clone)]
pub struct AppState {
    pub mode: AppMode,
    pub repository: Arc<dyn TaskRepository>,
    pub submission: TaskSubmissionService,
    pub gateway: RealtimeStatusGateway,
    pub schedules: Arc<ScheduleManager>,
}
