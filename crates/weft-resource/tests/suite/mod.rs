mod resource_manager;
