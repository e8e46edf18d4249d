mod device_hotplug;
mod media_pipeline;
